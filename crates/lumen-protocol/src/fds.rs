//! Side-channel file descriptor groups
//!
//! Descriptors never appear as integers inside a serialized body. A message
//! that carries descriptors records only how many travel out-of-band; the
//! descriptors themselves are moved into ordered groups, one group per nested
//! sub-message, and are sent after the body through the control channel.

use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;
use thiserror::Error;

/// Descriptors belonging to one nested sub-message
pub type FdGroup = Vec<OwnedFd>;

/// How many fd groups a result message contributes, in a fixed order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    NoFds,
    OneGroup,
    /// Outer message descriptors first, then those of its nested buffer
    TwoGroupsNestedOrder,
}

impl ResponseShape {
    pub fn max_groups(self) -> usize {
        match self {
            ResponseShape::NoFds => 0,
            ResponseShape::OneGroup => 1,
            ResponseShape::TwoGroupsNestedOrder => 2,
        }
    }
}

/// Errors re-attaching received descriptors to a decoded message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FdAttachError {
    #[error("Expected {expected} fd groups, received {actual}")]
    GroupCount { expected: usize, actual: usize },

    #[error("fd group {index} declares {expected} descriptors, received {actual}")]
    GroupSize {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Ordered sequence of fd groups for one wire message
#[derive(Debug, Default)]
pub struct FdSets {
    groups: Vec<FdGroup>,
}

impl FdSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group. Empty groups are not transmitted and are skipped.
    pub fn push(&mut self, group: FdGroup) {
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    pub fn groups(&self) -> &[FdGroup] {
        &self.groups
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.iter().map(Vec::len).collect()
    }

    pub fn total_fds(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn into_groups(self) -> Vec<FdGroup> {
        self.groups
    }
}

/// Descriptor slot of a sub-message: a count on the wire, owned fds in memory
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SideChannel {
    /// Number of descriptors that follow the body out-of-band
    pub fds_on_side_channel: u32,
    #[serde(skip)]
    pub fds: Vec<OwnedFd>,
}

impl SideChannel {
    pub fn with_fds(fds: Vec<OwnedFd>) -> Self {
        Self {
            fds_on_side_channel: fds.len() as u32,
            fds,
        }
    }

    /// Move the descriptors out. The declared count is left untouched, so a
    /// slot that declared more than it held still disagrees afterwards.
    pub fn take(&mut self) -> FdGroup {
        std::mem::take(&mut self.fds)
    }

    pub fn declared(&self) -> usize {
        self.fds_on_side_channel as usize
    }
}

/// Messages whose body may declare side-channel descriptors.
///
/// The defaults describe a message that never carries any.
pub trait CarriesFds {
    /// Move every descriptor out into groups, in nesting order
    fn extract_fds(&mut self) -> FdSets {
        FdSets::new()
    }

    /// Sizes of the non-empty groups the body declares, in arrival order
    fn declared_fd_groups(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Put received groups back into the slots that declared them
    fn attach_fds(&mut self, groups: Vec<FdGroup>) -> Result<(), FdAttachError> {
        attach_in_order(&mut [], groups)
    }
}

/// Declared non-empty group sizes of the given slots, in order
pub fn declared_sizes(channels: &[&SideChannel]) -> Vec<usize> {
    channels
        .iter()
        .map(|c| c.declared())
        .filter(|&n| n > 0)
        .collect()
}

/// Extract the given slots into groups, in order
pub fn extract_in_order(channels: &mut [&mut SideChannel]) -> FdSets {
    let mut sets = FdSets::new();
    for channel in channels.iter_mut() {
        sets.push(channel.take());
    }
    sets
}

/// Hand received groups to the slots that declared descriptors, in order
pub fn attach_in_order(
    channels: &mut [&mut SideChannel],
    groups: Vec<FdGroup>,
) -> Result<(), FdAttachError> {
    let expected = channels.iter().filter(|c| c.declared() > 0).count();
    if groups.len() != expected {
        return Err(FdAttachError::GroupCount {
            expected,
            actual: groups.len(),
        });
    }

    let mut groups = groups.into_iter();
    for (index, channel) in channels
        .iter_mut()
        .filter(|c| c.declared() > 0)
        .enumerate()
    {
        // Counted above, so a group is always present here.
        let Some(group) = groups.next() else { break };
        if group.len() != channel.declared() {
            return Err(FdAttachError::GroupSize {
                index,
                expected: channel.declared(),
                actual: group.len(),
            });
        }
        channel.fds = group;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fds(n: usize) -> Vec<OwnedFd> {
        (0..n)
            .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
            .collect()
    }

    #[test]
    fn empty_groups_are_skipped() {
        let mut sets = FdSets::new();
        sets.push(Vec::new());
        sets.push(fds(2));
        sets.push(Vec::new());
        assert_eq!(sets.len(), 1);
        assert_eq!(sets.total_fds(), 2);
    }

    #[test]
    fn take_leaves_count_behind() {
        let mut channel = SideChannel::with_fds(fds(3));
        let group = channel.take();
        assert_eq!(group.len(), 3);
        assert!(channel.fds.is_empty());
        assert_eq!(channel.declared(), 3);
    }

    #[test]
    fn take_keeps_an_unbacked_declaration() {
        let mut channel = SideChannel {
            fds_on_side_channel: 2,
            fds: fds(1),
        };
        let mut slots = [&mut channel];
        let sets = extract_in_order(&mut slots);
        assert_eq!(sets.group_sizes(), vec![1]);
        assert_eq!(declared_sizes(&[&channel]), vec![2]);
    }

    #[test]
    fn attach_checks_group_count() {
        let mut a = SideChannel {
            fds_on_side_channel: 1,
            fds: Vec::new(),
        };
        let err = attach_in_order(&mut [&mut a], vec![fds(1), fds(1)]).unwrap_err();
        assert_eq!(
            err,
            FdAttachError::GroupCount {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn attach_checks_group_size() {
        let mut a = SideChannel {
            fds_on_side_channel: 2,
            fds: Vec::new(),
        };
        let err = attach_in_order(&mut [&mut a], vec![fds(1)]).unwrap_err();
        assert_eq!(
            err,
            FdAttachError::GroupSize {
                index: 0,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn attach_skips_slots_without_descriptors() {
        let mut empty = SideChannel::default();
        let mut two = SideChannel {
            fds_on_side_channel: 2,
            fds: Vec::new(),
        };
        attach_in_order(&mut [&mut empty, &mut two], vec![fds(2)]).unwrap();
        assert!(empty.fds.is_empty());
        assert_eq!(two.fds.len(), 2);
    }

    #[test]
    fn shapes_bound_group_counts() {
        assert_eq!(ResponseShape::NoFds.max_groups(), 0);
        assert_eq!(ResponseShape::OneGroup.max_groups(), 1);
        assert_eq!(ResponseShape::TwoGroupsNestedOrder.max_groups(), 2);
    }
}
