// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Multi-key sample instruments ("programs"): a per-instrument mapping from
//! key number to a decoded sample. A note-on for a key that has no mapping
//! plays the nearest mapped key, rate-compensated by equal temperament.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::store::Sample;

/// All loaded programs, by instrument id.
#[derive(Default)]
pub struct ProgramMap {
    programs: HashMap<String, BTreeMap<i32, Arc<Sample>>>,
}

impl ProgramMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) a program. Empty zone maps are rejected by the
    /// router before they get here.
    pub fn insert(&mut self, inst_id: &str, zones: BTreeMap<i32, Arc<Sample>>) {
        self.programs.insert(inst_id.to_string(), zones);
    }

    pub fn contains(&self, inst_id: &str) -> bool {
        self.programs.contains_key(inst_id)
    }

    /// Finds the mapped key nearest to `note`. Iteration is in ascending key
    /// order and only a strictly smaller distance replaces the candidate, so
    /// a tie resolves to the numerically smaller key.
    pub fn nearest(&self, inst_id: &str, note: i32) -> Option<(i32, Arc<Sample>)> {
        let zones = self.programs.get(inst_id)?;
        let mut best: Option<(i32, &Arc<Sample>)> = None;
        for (&key, sample) in zones {
            let distance = (key - note).abs();
            match best {
                Some((best_key, _)) if (best_key - note).abs() <= distance => {}
                _ => best = Some((key, sample)),
            }
        }
        best.map(|(key, sample)| (key, sample.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rate: u32) -> Arc<Sample> {
        Arc::new(Sample::new(rate, vec![vec![0.0; 16]]))
    }

    fn program(keys: &[i32]) -> ProgramMap {
        let mut map = ProgramMap::new();
        let zones: BTreeMap<i32, Arc<Sample>> =
            keys.iter().map(|&k| (k, sample(48000))).collect();
        map.insert("piano", zones);
        map
    }

    #[test]
    fn test_exact_match() {
        let map = program(&[60, 64, 67]);
        let (key, _) = map.nearest("piano", 64).unwrap();
        assert_eq!(key, 64);
    }

    #[test]
    fn test_nearest_key() {
        let map = program(&[60, 72]);
        assert_eq!(map.nearest("piano", 63).unwrap().0, 60);
        assert_eq!(map.nearest("piano", 69).unwrap().0, 72);
    }

    #[test]
    fn test_tie_picks_smaller_key() {
        // 66 is equidistant from 60 and 72.
        let map = program(&[60, 72]);
        assert_eq!(map.nearest("piano", 66).unwrap().0, 60);
    }

    #[test]
    fn test_unknown_program() {
        let map = program(&[60]);
        assert!(map.nearest("strings", 60).is_none());
        assert!(!map.contains("strings"));
        assert!(map.contains("piano"));
    }
}
