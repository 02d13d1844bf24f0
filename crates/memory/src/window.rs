//! Sliding conversation window.
//!
//! The last N turns verbatim plus up to `pinned_max` pinned exchanges.
//! When a turn rolls off, the caller (the compactor agent) supplies a
//! subtext-preserving summary that stays in the window's summary tail.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowTurn {
    pub turn_number: i64,
    pub player_input: String,
    pub narrative: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinSource {
    Player,
    Director,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedExchange {
    pub turn: WindowTurn,
    pub source: PinSource,
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_size: usize,
    pinned_max: usize,
    turns: VecDeque<WindowTurn>,
    pinned: Vec<PinnedExchange>,
    rolled_summaries: Vec<String>,
}

impl SlidingWindow {
    pub fn new(window_size: usize, pinned_max: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            pinned_max,
            turns: VecDeque::new(),
            pinned: Vec::new(),
            rolled_summaries: Vec::new(),
        }
    }

    /// Push a completed turn. Returns the turn that rolled off, if any —
    /// the caller summarizes it and hands the summary back via
    /// [`SlidingWindow::add_rolloff_summary`].
    pub fn push(&mut self, turn: WindowTurn) -> Option<WindowTurn> {
        self.turns.push_back(turn);
        if self.turns.len() > self.window_size {
            self.turns.pop_front()
        } else {
            None
        }
    }

    pub fn add_rolloff_summary(&mut self, summary: String) {
        self.rolled_summaries.push(summary);
        // Keep the summary tail bounded; older context lives in memory.
        let overflow = self.rolled_summaries.len().saturating_sub(self.window_size);
        if overflow > 0 {
            self.rolled_summaries.drain(..overflow);
        }
    }

    /// Pin an exchange. The oldest pin is evicted at capacity; both player
    /// and director pins share the same bounded list.
    pub fn pin(&mut self, turn: WindowTurn, source: PinSource) {
        if self.pinned_max == 0 {
            return;
        }
        // Re-pinning a turn replaces the earlier pin.
        self.pinned.retain(|p| p.turn.turn_number != turn.turn_number);
        if self.pinned.len() >= self.pinned_max {
            self.pinned.remove(0);
        }
        self.pinned.push(PinnedExchange { turn, source });
    }

    pub fn turns(&self) -> impl Iterator<Item = &WindowTurn> {
        self.turns.iter()
    }

    pub fn pinned(&self) -> &[PinnedExchange] {
        &self.pinned
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render for the per-turn dynamic prompt block: summary tail, pinned
    /// exchanges, then the verbatim window.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.rolled_summaries.is_empty() {
            out.push_str("EARLIER (summarized):\n");
            for summary in &self.rolled_summaries {
                out.push_str("- ");
                out.push_str(summary);
                out.push('\n');
            }
            out.push('\n');
        }
        if !self.pinned.is_empty() {
            out.push_str("PINNED EXCHANGES:\n");
            for pin in &self.pinned {
                out.push_str(&format!(
                    "[turn {}] Player: {}\n{}\n",
                    pin.turn.turn_number, pin.turn.player_input, pin.turn.narrative
                ));
            }
            out.push('\n');
        }
        out.push_str("RECENT TURNS:\n");
        for turn in &self.turns {
            out.push_str(&format!(
                "[turn {}] Player: {}\n{}\n",
                turn.turn_number, turn.player_input, turn.narrative
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: i64) -> WindowTurn {
        WindowTurn {
            turn_number: n,
            player_input: format!("input {n}"),
            narrative: format!("narrative {n}"),
        }
    }

    #[test]
    fn window_holds_last_n_verbatim() {
        let mut window = SlidingWindow::new(3, 5);
        for n in 1..=5 {
            window.push(turn(n));
        }
        let numbers: Vec<i64> = window.turns().map(|t| t.turn_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
    }

    #[test]
    fn overflow_returns_the_rolled_off_turn() {
        let mut window = SlidingWindow::new(2, 5);
        assert!(window.push(turn(1)).is_none());
        assert!(window.push(turn(2)).is_none());
        let rolled = window.push(turn(3)).unwrap();
        assert_eq!(rolled.turn_number, 1);
    }

    #[test]
    fn pins_are_bounded_and_deduplicated() {
        let mut window = SlidingWindow::new(20, 2);
        window.pin(turn(1), PinSource::Player);
        window.pin(turn(2), PinSource::Director);
        window.pin(turn(3), PinSource::Player);
        assert_eq!(window.pinned().len(), 2);
        assert_eq!(window.pinned()[0].turn.turn_number, 2);

        // Re-pinning turn 3 doesn't duplicate it.
        window.pin(turn(3), PinSource::Director);
        assert_eq!(window.pinned().len(), 2);
        assert_eq!(
            window
                .pinned()
                .iter()
                .filter(|p| p.turn.turn_number == 3)
                .count(),
            1
        );
    }

    #[test]
    fn render_orders_summaries_pins_then_recent() {
        let mut window = SlidingWindow::new(2, 2);
        window.push(turn(1));
        window.push(turn(2));
        window.push(turn(3));
        window.add_rolloff_summary("Turn one, compressed.".to_string());
        window.pin(turn(2), PinSource::Player);

        let rendered = window.render();
        let summary_at = rendered.find("EARLIER").unwrap();
        let pinned_at = rendered.find("PINNED").unwrap();
        let recent_at = rendered.find("RECENT").unwrap();
        assert!(summary_at < pinned_at && pinned_at < recent_at);
    }

    #[test]
    fn zero_pin_capacity_ignores_pins() {
        let mut window = SlidingWindow::new(5, 0);
        window.pin(turn(1), PinSource::Player);
        assert!(window.pinned().is_empty());
    }
}
