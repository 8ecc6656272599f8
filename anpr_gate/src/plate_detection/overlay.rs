use super::BoundingBox;

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_OVERLAY_TTL: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayEntry {
    pub text: String,
    pub bbox: BoundingBox,
    pub timestamp: Instant,
}

/// Most recent detection for on-stream annotation. One slot, overwritten on every write,
/// expired lazily by readers.
#[derive(Default)]
pub struct OverlayState {
    slot: Mutex<Option<OverlayEntry>>,
}

impl OverlayState {
    pub fn write(&self, entry: OverlayEntry) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(entry);
        }
    }

    pub fn peek(&self, max_age: Duration) -> Option<OverlayEntry> {
        self.peek_at(max_age, Instant::now())
    }

    pub fn peek_at(&self, max_age: Duration, now: Instant) -> Option<OverlayEntry> {
        let slot = self.slot.lock().ok()?;
        slot.as_ref()
            .filter(|entry| now.saturating_duration_since(entry.timestamp) <= max_age)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, timestamp: Instant) -> OverlayEntry {
        OverlayEntry {
            text: text.to_string(),
            bbox: BoundingBox::new(50, 50, 150, 90, 0.8),
            timestamp,
        }
    }

    #[test]
    fn empty_slot_has_nothing_to_show() {
        assert_eq!(OverlayState::default().peek(DEFAULT_OVERLAY_TTL), None);
    }

    #[test]
    fn entry_is_visible_until_its_ttl_elapses() {
        let overlay = OverlayState::default();
        let t0 = Instant::now();
        overlay.write(entry("AB123CD", t0));

        let at_2s = overlay.peek_at(DEFAULT_OVERLAY_TTL, t0 + Duration::from_secs(2));
        assert_eq!(at_2s.map(|e| e.text), Some("AB123CD".to_string()));
        assert!(overlay
            .peek_at(DEFAULT_OVERLAY_TTL, t0 + Duration::from_secs(3))
            .is_some());
        assert_eq!(
            overlay.peek_at(DEFAULT_OVERLAY_TTL, t0 + Duration::from_secs(4)),
            None
        );
    }

    #[test]
    fn writes_replace_the_previous_entry() {
        let overlay = OverlayState::default();
        let t0 = Instant::now();
        overlay.write(entry("AB123CD", t0));
        overlay.write(entry("ZZ999ZZ", t0 + Duration::from_secs(1)));

        let shown = overlay
            .peek_at(DEFAULT_OVERLAY_TTL, t0 + Duration::from_secs(2))
            .unwrap();
        assert_eq!(shown.text, "ZZ999ZZ");
    }
}
