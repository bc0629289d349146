//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_AREA_ID;
use crate::error::Error;

// Area configuration entry: an area identifier plus the regexes electing
// neighbors and/or interfaces into it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AreaCfg {
    pub area_id: String,
    pub neighbor_regexes: Vec<String>,
    pub interface_regexes: Vec<String>,
}

// Ordered table of compiled area entries, consulted once per unknown
// neighbor. Compiled sets are immutable for the lifetime of the engine;
// dynamic reconfiguration isn't supported.
#[derive(Debug)]
pub struct AreaTable {
    entries: Vec<AreaEntry>,
}

#[derive(Debug)]
struct AreaEntry {
    area_id: String,
    neighbor_regexes: Option<RegexSet>,
    interface_regexes: Option<RegexSet>,
}

// Reasons why area resolution can refuse a neighbor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AreaResolveError {
    NoMatch,
    MultipleMatches,
}

// ===== impl AreaTable =====

impl AreaTable {
    // Compiles the area configuration into a lookup table.
    //
    // When no configuration is supplied, a single catch-all entry mapping
    // everything to the default area is synthesized for backward
    // compatibility.
    pub fn new(areas: &[AreaCfg]) -> Result<AreaTable, Error> {
        if areas.is_empty() {
            let catch_all = AreaCfg {
                area_id: DEFAULT_AREA_ID.to_owned(),
                neighbor_regexes: vec![".*".to_owned()],
                interface_regexes: vec![".*".to_owned()],
            };
            return AreaTable::new(std::slice::from_ref(&catch_all));
        }

        let mut entries = Vec::with_capacity(areas.len());
        for area in areas {
            if area.neighbor_regexes.is_empty()
                && area.interface_regexes.is_empty()
            {
                return Err(Error::AreaWithoutRegexes(area.area_id.clone()));
            }
            entries.push(AreaEntry {
                area_id: area.area_id.clone(),
                neighbor_regexes: compile_regexes(
                    &area.area_id,
                    &area.neighbor_regexes,
                )?,
                interface_regexes: compile_regexes(
                    &area.area_id,
                    &area.interface_regexes,
                )?,
            });
        }

        Ok(AreaTable { entries })
    }

    // Deduces the area a neighbor belongs to.
    //
    // Both regex sets present means both the peer node name and the local
    // interface name need to match; a single set suffices on its own.
    // Anything other than exactly one candidate area refuses the neighbor.
    pub fn resolve(
        &self,
        peer_node_name: &str,
        ifname: &str,
    ) -> Result<&str, AreaResolveError> {
        let mut candidates = self.entries.iter().filter(|entry| {
            match (&entry.neighbor_regexes, &entry.interface_regexes) {
                (Some(neighbor), Some(interface)) => {
                    neighbor.is_match(peer_node_name)
                        && interface.is_match(ifname)
                }
                (Some(neighbor), None) => neighbor.is_match(peer_node_name),
                (None, Some(interface)) => interface.is_match(ifname),
                (None, None) => unreachable!(),
            }
        });

        let area = candidates.next().ok_or(AreaResolveError::NoMatch)?;
        if candidates.next().is_some() {
            return Err(AreaResolveError::MultipleMatches);
        }
        Ok(&area.area_id)
    }
}

// ===== helper functions =====

fn compile_regexes(
    area_id: &str,
    regexes: &[String],
) -> Result<Option<RegexSet>, Error> {
    if regexes.is_empty() {
        return Ok(None);
    }

    // Anchor every pattern at both ends so partial matches don't elect a
    // neighbor into an area.
    let anchored = regexes
        .iter()
        .map(|regex| format!("^(?:{regex})$"))
        .collect::<Vec<_>>();
    RegexSetBuilder::new(&anchored)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|error| Error::InvalidAreaRegex(area_id.to_owned(), error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(
        id: &str,
        neighbors: &[&str],
        interfaces: &[&str],
    ) -> AreaCfg {
        AreaCfg {
            area_id: id.to_owned(),
            neighbor_regexes: neighbors.iter().map(|s| s.to_string()).collect(),
            interface_regexes: interfaces
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    #[test]
    fn test_default_table() {
        let table = AreaTable::new(&[]).unwrap();
        assert_eq!(table.resolve("node-1", "eth0"), Ok(DEFAULT_AREA_ID));
        assert_eq!(table.resolve("anything", "po1"), Ok(DEFAULT_AREA_ID));
    }

    #[test]
    fn test_resolution_rules() {
        let table = AreaTable::new(&[
            area("1", &["rsw.*"], &["eth.*"]),
            area("2", &["fsw.*"], &[]),
            area("3", &[], &["po.*"]),
        ])
        .unwrap();

        // Both sets present: both must match.
        assert_eq!(table.resolve("rsw001", "eth0"), Ok("1"));
        assert_eq!(
            table.resolve("rsw001", "wrong0"),
            Err(AreaResolveError::NoMatch)
        );

        // Single set suffices on its own.
        assert_eq!(table.resolve("fsw001", "wrong0"), Ok("2"));
        assert_eq!(table.resolve("unknown", "po1"), Ok("3"));

        // More than one candidate refuses the neighbor.
        assert_eq!(
            table.resolve("fsw001", "po1"),
            Err(AreaResolveError::MultipleMatches)
        );
    }

    #[test]
    fn test_anchoring_and_case() {
        let table = AreaTable::new(&[area("1", &["rsw.*"], &[])]).unwrap();

        // Patterns are anchored at both ends and case-insensitive.
        assert_eq!(table.resolve("RSW001", "eth0"), Ok("1"));
        assert_eq!(
            table.resolve("xrsw001", "eth0"),
            Err(AreaResolveError::NoMatch)
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            AreaTable::new(&[area("1", &[], &[])]),
            Err(Error::AreaWithoutRegexes(_))
        ));
        assert!(matches!(
            AreaTable::new(&[area("1", &["("], &[])]),
            Err(Error::InvalidAreaRegex(..))
        ));
    }
}
