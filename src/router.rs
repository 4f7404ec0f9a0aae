// router.rs
//
// Maps a FIMS uri to a workspace location. One entry per routable leaf:
// every non-`individual_bits` decode id, every labeled `individual_bits`
// bit, and one `ALL` entry per component for a bare `/components/<id>`
// get/pub. This is `Uri_Info`/the uri hash table from the original
// client's `client_structs.hpp`, minus the thread-index field (this
// crate dispatches to workers through the shared poll queue instead of
// pinning a uri to a fixed thread).
//
// The listener strips any trailing `/_raw`, `/_timings`,
// `/_reset_timings`, or `/_reload` flag before calling `lookup` — this
// table only ever sees base uris.

use std::collections::HashMap;

use crate::decode::BitStrings;
use crate::workspace::Workspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    /// `/components/<id>` with no leaf: every decode in the component.
    AllOfComponent { component_idx: usize },
    Decode {
        component_idx: usize,
        map_idx: usize,
        decode_idx: usize,
        /// `Some` only for a labeled bit of an `individual_bits` decode.
        bit_idx: Option<u8>,
    },
}

pub struct Router {
    routes: HashMap<String, RouteTarget>,
}

impl Router {
    pub fn build(workspace: &Workspace) -> Router {
        let mut routes = HashMap::new();

        for (component_idx, comp) in workspace.components.iter().enumerate() {
            routes.insert(
                format!("/components/{}", comp.id),
                RouteTarget::AllOfComponent { component_idx },
            );

            for (map_idx, map) in comp.register_maps.iter().enumerate() {
                for (decode_idx, decode) in map.decodes.iter().enumerate() {
                    match &decode.spec.bit_strings {
                        Some(BitStrings::IndividualBits(bits)) => {
                            for bit in bits {
                                let Some(label) = &bit.label else { continue };
                                routes.insert(
                                    format!("/components/{}/{}", comp.id, label),
                                    RouteTarget::Decode {
                                        component_idx,
                                        map_idx,
                                        decode_idx,
                                        bit_idx: Some(bit.bit),
                                    },
                                );
                            }
                        }
                        _ => {
                            routes.insert(
                                format!("/components/{}/{}", comp.id, decode.spec.id),
                                RouteTarget::Decode {
                                    component_idx,
                                    map_idx,
                                    decode_idx,
                                    bit_idx: None,
                                },
                            );
                        }
                    }
                }
            }
        }

        Router { routes }
    }

    /// Look up an already-flag-stripped uri. Never panics on a miss: an
    /// unknown uri is a normal client error (§7), not a bug.
    pub fn lookup(&self, uri: &str) -> Result<RouteTarget, String> {
        self.routes
            .get(uri)
            .copied()
            .ok_or_else(|| format!("uri \"{}\" doesn't exist", uri))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
