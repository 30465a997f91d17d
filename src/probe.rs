//! Electrode geometry
//!
//! Each channel carries a fixed neighbor set (itself included) used for
//! spatial exclusion, noise tests and waveform windows. Adjacency comes
//! either from explicit lists or from a radius test over 2-D positions.

use crate::error::ClusterError;

#[derive(Debug, Clone)]
pub struct Probe {
    neighbors: Vec<Vec<usize>>,
    own_pos: Vec<usize>,
}

impl Probe {
    /// Build from explicit adjacency lists. Every list is sorted and made to
    /// contain its own channel.
    pub fn from_adjacency(mut lists: Vec<Vec<usize>>) -> Result<Self, ClusterError> {
        let n = lists.len();
        for (ch, list) in lists.iter_mut().enumerate() {
            if !list.contains(&ch) {
                list.push(ch);
            }
            list.sort_unstable();
            list.dedup();
            if list.iter().any(|&c| c >= n) {
                return Err(ClusterError::BadProbe {
                    reason: format!("channel {ch} references a neighbor outside 0..{n}"),
                });
            }
        }
        let own_pos = lists
            .iter()
            .enumerate()
            .map(|(ch, list)| list.iter().position(|&c| c == ch).unwrap())
            .collect();
        Ok(Self { neighbors: lists, own_pos })
    }

    /// Build from 2-D electrode positions: channels within `radius` of each
    /// other are neighbors.
    pub fn from_positions(positions: &[(f32, f32)], radius: f32) -> Self {
        let n = positions.len();
        let r2 = radius * radius;
        let neighbors: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| {
                        let dx = positions[i].0 - positions[j].0;
                        let dy = positions[i].1 - positions[j].1;
                        dx * dx + dy * dy <= r2
                    })
                    .collect()
            })
            .collect();
        let own_pos = neighbors
            .iter()
            .enumerate()
            .map(|(ch, list)| list.iter().position(|&c| c == ch).unwrap())
            .collect();
        Self { neighbors, own_pos }
    }

    /// A linear array with `span` neighboring channels on each side.
    pub fn linear(n_channels: usize, span: usize) -> Self {
        let neighbors: Vec<Vec<usize>> = (0..n_channels)
            .map(|ch| {
                (ch.saturating_sub(span)..(ch + span + 1).min(n_channels)).collect()
            })
            .collect();
        let own_pos = neighbors
            .iter()
            .enumerate()
            .map(|(ch, list)| list.iter().position(|&c| c == ch).unwrap())
            .collect();
        Self { neighbors, own_pos }
    }

    pub fn n_channels(&self) -> usize {
        self.neighbors.len()
    }

    /// Sorted neighbor channels of `ch`, including `ch` itself.
    pub fn neighbors(&self, ch: usize) -> &[usize] {
        &self.neighbors[ch]
    }

    /// Index of `ch` inside its own neighbor list.
    pub fn own_pos(&self, ch: usize) -> usize {
        self.own_pos[ch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_adjacency() {
        let probe = Probe::linear(4, 1);
        assert_eq!(probe.neighbors(0), &[0, 1]);
        assert_eq!(probe.neighbors(2), &[1, 2, 3]);
        assert_eq!(probe.own_pos(2), 1);
        assert_eq!(probe.own_pos(0), 0);
    }

    #[test]
    fn test_adjacency_inserts_self() {
        let probe = Probe::from_adjacency(vec![vec![1], vec![0]]).unwrap();
        assert_eq!(probe.neighbors(0), &[0, 1]);
        assert_eq!(probe.neighbors(1), &[0, 1]);
        assert!(Probe::from_adjacency(vec![vec![7]]).is_err());
    }

    #[test]
    fn test_radius_adjacency() {
        let positions = [(0.0, 0.0), (1.0, 0.0), (10.0, 0.0)];
        let probe = Probe::from_positions(&positions, 1.5);
        assert_eq!(probe.neighbors(0), &[0, 1]);
        assert_eq!(probe.neighbors(2), &[2]);
    }
}
