//! Three-tier prompt composition.
//!
//! Every prompt the engine sends is assembled from three blocks in fixed
//! order. Block 1 is identical across turns within a session, so providers
//! with prefix caching reuse it for free; Block 2 changes on director
//! updates; Block 3 is rebuilt every turn. New structural context belongs in
//! Block 1 or 2, never Block 3.

/// The stable-prefix / session / per-turn prompt blocks.
#[derive(Debug, Clone, Default)]
pub struct PromptBlocks {
    /// Profile DNA, power system, composition guidance, rule-library chunks,
    /// agent base prompt. Stable for the whole session.
    pub stable: String,
    /// Campaign bible excerpt, active foreshadowing summary, arc-phase
    /// directive. Changes when the director updates the bible.
    pub session: String,
    /// Sliding window, ranked memories, intent, outcome, present NPCs.
    pub dynamic: String,
}

impl PromptBlocks {
    pub fn new(
        stable: impl Into<String>,
        session: impl Into<String>,
        dynamic: impl Into<String>,
    ) -> Self {
        Self {
            stable: stable.into(),
            session: session.into(),
            dynamic: dynamic.into(),
        }
    }

    /// Render the blocks into the system string sent to the provider.
    /// Order is fixed: stable, session, dynamic.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.stable.len() + self.session.len() + self.dynamic.len() + 8,
        );
        for part in [&self.stable, &self.session, &self.dynamic] {
            let part = part.trim_end();
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(part);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_in_fixed_order() {
        let blocks = PromptBlocks::new("STABLE", "SESSION", "DYNAMIC");
        let rendered = blocks.render();
        let stable_at = rendered.find("STABLE").unwrap();
        let session_at = rendered.find("SESSION").unwrap();
        let dynamic_at = rendered.find("DYNAMIC").unwrap();
        assert!(stable_at < session_at && session_at < dynamic_at);
    }

    #[test]
    fn skips_empty_blocks_without_extra_separators() {
        let blocks = PromptBlocks::new("STABLE", "", "DYNAMIC");
        assert_eq!(blocks.render(), "STABLE\n\nDYNAMIC");
    }

    #[test]
    fn identical_stable_prefix_across_turns() {
        let turn_one = PromptBlocks::new("PREFIX", "bible v1", "turn 1");
        let turn_two = PromptBlocks::new("PREFIX", "bible v1", "turn 2");
        // The cache-relevant property: everything before the dynamic block
        // is byte-identical between consecutive turns.
        let one = turn_one.render();
        let two = turn_two.render();
        let cut = one.rfind("turn 1").unwrap();
        assert_eq!(&one[..cut], &two[..two.rfind("turn 2").unwrap()]);
    }
}
