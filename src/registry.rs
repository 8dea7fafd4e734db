//! Display Registry
//!
//! Tracks the set of connected displays and owns the control loop's delayed
//! tasks. Topology bursts are coalesced by re-arming a single pending timer, so
//! a reconciliation pass only ever sees the net display set.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Instant;
use tracing::{debug, info};

use crate::types::{Display, DisplayId, DisplaySelector};

/// Delayed work the control loop performs when a deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// Reconcile after display-configuration changes settle
    Topology,
    /// Resume playback after a wake notification settles
    Wake,
    /// Resume a display restored by hot-plug
    ResumeGrace(DisplayId),
    /// Apply the last requested volume for a display
    Volume(DisplayId),
}

/// At most one pending deadline per key; arming again replaces it
#[derive(Debug)]
pub struct Timers<K> {
    pending: HashMap<K, Instant>,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> Timers<K> {
    pub fn arm(&mut self, key: K, deadline: Instant) {
        self.pending.insert(key, deadline);
    }

    pub fn cancel(&mut self, key: K) -> bool {
        self.pending.remove(&key).is_some()
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(K, Instant)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*key, *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        for (key, _) in &due {
            self.pending.remove(key);
        }
        due.into_iter().map(|(key, _)| key).collect()
    }
}

/// Net change between two display sets
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added: Vec<DisplayId>,
    pub removed: Vec<DisplayId>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DisplayRegistry {
    displays: BTreeMap<DisplayId, Display>,
    timers: Timers<TimerClass>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known display set and report what changed
    pub fn refresh(&mut self, current: Vec<Display>) -> TopologyDiff {
        let next: BTreeMap<DisplayId, Display> =
            current.into_iter().map(|display| (display.id, display)).collect();

        let diff = TopologyDiff {
            added: next
                .keys()
                .filter(|id| !self.displays.contains_key(id))
                .copied()
                .collect(),
            removed: self
                .displays
                .keys()
                .filter(|id| !next.contains_key(id))
                .copied()
                .collect(),
        };

        if !diff.is_empty() {
            info!(
                added = ?diff.added,
                removed = ?diff.removed,
                total = next.len(),
                "Display set changed"
            );
        }
        self.displays = next;
        diff
    }

    pub fn contains(&self, id: DisplayId) -> bool {
        self.displays.contains_key(&id)
    }

    pub fn get(&self, id: DisplayId) -> Option<&Display> {
        self.displays.get(&id)
    }

    /// Connected display ids in ascending order
    pub fn ids(&self) -> Vec<DisplayId> {
        self.displays.keys().copied().collect()
    }

    pub fn displays(&self) -> impl Iterator<Item = &Display> {
        self.displays.values()
    }

    pub fn len(&self) -> usize {
        self.displays.len()
    }

    pub fn find(&self, selector: &DisplaySelector) -> Option<DisplayId> {
        match selector {
            DisplaySelector::Id(id) => self.contains(*id).then_some(*id),
            DisplaySelector::Name(name) => self
                .displays
                .values()
                .find(|display| display.name.eq_ignore_ascii_case(name))
                .map(|display| display.id),
        }
    }

    pub fn timers(&self) -> &Timers<TimerClass> {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut Timers<TimerClass> {
        &mut self.timers
    }

    /// Re-arm the single topology timer
    pub fn debounce(&mut self, class: TimerClass, deadline: Instant) {
        if self.timers.is_armed(class) {
            debug!(?class, "Coalescing into pending timer");
        }
        self.timers.arm(class, deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;
    use std::time::Duration;

    fn display(id: u32, name: &str) -> Display {
        Display {
            id: DisplayId(id),
            frame: Rect::new(0, 0, 1920, 1080),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_refresh_reports_net_change() {
        let mut registry = DisplayRegistry::new();
        let diff = registry.refresh(vec![display(1, "eDP-1"), display(2, "HDMI-1")]);
        assert_eq!(diff.added, vec![DisplayId(1), DisplayId(2)]);
        assert!(diff.removed.is_empty());

        let diff = registry.refresh(vec![display(2, "HDMI-1"), display(3, "DP-2")]);
        assert_eq!(diff.added, vec![DisplayId(3)]);
        assert_eq!(diff.removed, vec![DisplayId(1)]);
        assert_eq!(registry.ids(), vec![DisplayId(2), DisplayId(3)]);

        assert!(registry.refresh(vec![display(2, "HDMI-1"), display(3, "DP-2")]).is_empty());
    }

    #[test]
    fn test_find_by_id_or_name() {
        let mut registry = DisplayRegistry::new();
        registry.refresh(vec![display(7, "DP-1")]);
        assert_eq!(registry.find(&DisplaySelector::Id(DisplayId(7))), Some(DisplayId(7)));
        assert_eq!(registry.find(&DisplaySelector::Id(DisplayId(8))), None);
        assert_eq!(registry.find(&DisplaySelector::Name("dp-1".into())), Some(DisplayId(7)));
    }

    #[test]
    fn test_rearming_replaces_deadline() {
        let start = Instant::now();
        let mut timers = Timers::default();
        timers.arm(TimerClass::Topology, start + Duration::from_millis(300));
        timers.arm(TimerClass::Topology, start + Duration::from_millis(500));

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_millis(500)));
        assert!(timers.take_due(start + Duration::from_millis(400)).is_empty());
        assert_eq!(
            timers.take_due(start + Duration::from_millis(500)),
            vec![TimerClass::Topology]
        );
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_take_due_orders_by_deadline() {
        let start = Instant::now();
        let mut timers = Timers::default();
        timers.arm(TimerClass::Wake, start + Duration::from_millis(50));
        timers.arm(TimerClass::ResumeGrace(DisplayId(1)), start + Duration::from_millis(10));
        timers.arm(TimerClass::Volume(DisplayId(1)), start + Duration::from_secs(5));

        let due = timers.take_due(start + Duration::from_millis(100));
        assert_eq!(due, vec![TimerClass::ResumeGrace(DisplayId(1)), TimerClass::Wake]);
        assert!(timers.is_armed(TimerClass::Volume(DisplayId(1))));
        assert!(timers.cancel(TimerClass::Volume(DisplayId(1))));
        assert!(!timers.cancel(TimerClass::Volume(DisplayId(1))));
    }
}
