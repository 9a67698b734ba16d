//! Group-scoped visibility resolution.
//!
//! Pure functions over already-loaded records: no I/O happens here.
//! Callers read storage once at the command edge and pass the snapshot in.

use std::collections::BTreeSet;

use crate::personas::{PersonaRecord, GROUP_WILDCARD};

/// The set of groups a viewer can see: its primary group plus everything
/// in `groups_visible`. A wildcard entry means "all groups".
pub fn visible_groups(viewer: &PersonaRecord) -> BTreeSet<String> {
    let mut groups = viewer.groups_visible.clone();
    if let Some(primary) = &viewer.group_primary {
        groups.insert(primary.clone());
    }
    groups
}

fn sees_everything(viewer: &PersonaRecord) -> bool {
    viewer.is_primary() || viewer.groups_visible.contains(GROUP_WILDCARD)
}

/// Which peer personas the viewer may see. The primary persona sees all
/// others; everyone else sees peers whose primary group falls inside the
/// viewer's visible set. Visibility is not symmetric.
pub fn visible_personas<'a>(
    viewer: &PersonaRecord,
    all: &'a [PersonaRecord],
) -> Vec<&'a PersonaRecord> {
    let groups = visible_groups(viewer);

    all.iter()
        .filter(|p| p.name != viewer.name)
        .filter(|p| {
            if sees_everything(viewer) {
                return true;
            }
            match &p.group_primary {
                Some(g) => groups.contains(g),
                None => false,
            }
        })
        .collect()
}

/// Whether a row with the given `persona_groups` is visible to the viewer.
/// An empty set means the row is global.
pub fn row_visible(row_groups: &BTreeSet<String>, viewer: &PersonaRecord) -> bool {
    if row_groups.is_empty() {
        return true;
    }
    if sees_everything(viewer) {
        return true;
    }
    let groups = visible_groups(viewer);
    row_groups.iter().any(|g| groups.contains(g))
}

/// Tag a row being written on behalf of the viewer: the viewer's primary
/// group joins the row's set. Ungrouped personas write global rows.
pub fn tag_row_on_write(row_groups: &mut BTreeSet<String>, viewer: &PersonaRecord) {
    if let Some(primary) = &viewer.group_primary {
        row_groups.insert(primary.clone());
    }
}
