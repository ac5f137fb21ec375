//! Routing rule list (`SPEC_FULL.md` §4.7 step 5).
//!
//! Rules are tried in order; the first match wins. Each rule matches either
//! a MAC address under a mask or an ethertype, and carries its own priority
//! field purely as metadata the caller may sort by before installing the
//! list — this module itself is order-is-priority, matching the distilled
//! spec's "try the list in order" wording exactly.

use crate::wire::Mac;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decision {
    Drop,
    Forward(u8),
    Broadcast,
    Multicast,
    Loopback,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Match {
    Mac { value: Mac, mask: Mac },
    Ethertype(u16),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Rule {
    pub matcher: Match,
    pub src_nic: Option<u8>,
    pub decision: Decision,
    pub priority: u8,
}

impl Rule {
    fn matches_mac(value: &Mac, mask: &Mac, candidate: &Mac) -> bool {
        value
            .iter()
            .zip(mask.iter())
            .zip(candidate.iter())
            .all(|((v, m), c)| (v & m) == (c & m))
    }

    /// Whether this rule applies to a frame arriving on `source_nic` with
    /// destination `dst_mac` and `ethertype`.
    fn applies(&self, source_nic: u8, dst_mac: &Mac, ethertype: u16) -> bool {
        if let Some(required) = self.src_nic {
            if required != source_nic {
                return false;
            }
        }
        match &self.matcher {
            Match::Mac { value, mask } => Self::matches_mac(value, mask, dst_mac),
            Match::Ethertype(et) => *et == ethertype,
        }
    }
}

/// Selector used to remove a previously-installed rule (`§6`
/// `remove_route_rule`). Matches on the rule's matcher and source-NIC
/// filter, ignoring `decision`/`priority` so callers don't need to
/// reconstruct the exact decision to remove a rule.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RuleSelector {
    pub matcher: Match,
    pub src_nic: Option<u8>,
}

/// A fixed-capacity, order-preserving rule list.
pub struct RuleList<const N: usize> {
    rules: heapless::Vec<Rule, N>,
}

impl<const N: usize> RuleList<N> {
    pub fn new() -> Self {
        Self { rules: heapless::Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Appends `rule` to the end of the list (lowest precedence among
    /// existing rules, since the list is tried front-to-back).
    pub fn add(&mut self, rule: Rule) -> Result<(), crate::error::DriverError> {
        self.rules.push(rule).map_err(|_| crate::error::DriverError::NoResources)
    }

    /// Removes the first rule matching `selector`. Returns whether one was
    /// removed.
    pub fn remove(&mut self, selector: RuleSelector) -> bool {
        if let Some(pos) = self.rules.iter().position(|r| {
            r.matcher == selector.matcher && r.src_nic == selector.src_nic
        }) {
            self.rules.remove(pos);
            true
        } else {
            false
        }
    }

    /// Tries each rule in order, returning the first match's decision
    /// (`§4.7` step 5: "MAC match under mask, then an ethertype match" —
    /// callers populate the list with MAC rules ahead of ethertype rules
    /// when that ordering is desired; the list itself is order-agnostic).
    pub fn evaluate(&self, source_nic: u8, dst_mac: &Mac, ethertype: u16) -> Option<Decision> {
        self.rules
            .iter()
            .find(|r| r.applies(source_nic, dst_mac, ethertype))
            .map(|r| r.decision)
    }
}

impl<const N: usize> Default for RuleList<N> {
    fn default() -> Self {
        Self::new()
    }
}
