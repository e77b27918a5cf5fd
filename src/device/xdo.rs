//! XDO-style key sequence grammar.
//!
//! A sequence is whitespace-separated chords; a chord is `+`-joined tokens.
//! Tokens are either modifiers (`ctrl`, `shift`, `alt`, `super` and its
//! aliases `meta`, `win`, `cmd`) or literal keys (`a`, `1`, `enter`, `esc`,
//! `tab`, `space`, arrows, `f1`–`f24`, …). For each chord the modifiers are
//! pressed in order, each literal key is pressed and released, then the
//! modifiers are released in reverse order:
//!
//! ```text
//! "ctrl+c"  →  ctrl↓ c↓ c↑ ctrl↑
//! ```

/// One synthesized key transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Canonical lowercase key name. Modifier aliases are normalized to
    /// `super`.
    pub key: String,
    /// `true` = press, `false` = release.
    pub down: bool,
}

impl KeyEvent {
    fn down(key: &str) -> Self {
        Self { key: key.to_string(), down: true }
    }

    fn up(key: &str) -> Self {
        Self { key: key.to_string(), down: false }
    }
}

const MODIFIERS: &[&str] = &["ctrl", "shift", "alt", "super"];

fn canonical(token: &str) -> String {
    match token {
        "meta" | "win" | "cmd" => "super".to_string(),
        other => other.to_string(),
    }
}

/// Parse a sequence into chords of ordered key events.
///
/// Unknown tokens are treated as literal keys; validation of whether a key
/// actually exists is the input backend's concern.
pub fn parse(sequence: &str) -> Vec<Vec<KeyEvent>> {
    sequence
        .split_whitespace()
        .map(|chord| {
            let tokens: Vec<String> = chord
                .split('+')
                .filter(|t| !t.is_empty())
                .map(|t| canonical(&t.to_lowercase()))
                .collect();
            let (modifiers, keys): (Vec<&String>, Vec<&String>) =
                tokens.iter().partition(|t| MODIFIERS.contains(&t.as_str()));

            let mut events = Vec::with_capacity(tokens.len() * 2);
            for modifier in &modifiers {
                events.push(KeyEvent::down(modifier));
            }
            for key in &keys {
                events.push(KeyEvent::down(key));
                events.push(KeyEvent::up(key));
            }
            for modifier in modifiers.iter().rev() {
                events.push(KeyEvent::up(modifier));
            }
            events
        })
        .filter(|events| !events.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(sequence: &str) -> Vec<(String, bool)> {
        parse(sequence)
            .into_iter()
            .flatten()
            .map(|e| (e.key, e.down))
            .collect()
    }

    #[test]
    fn copy_paste_sequence_orders_events() {
        let events = flat("ctrl+c ctrl+v");
        let expected: Vec<(String, bool)> = [
            ("ctrl", true),
            ("c", true),
            ("c", false),
            ("ctrl", false),
            ("ctrl", true),
            ("v", true),
            ("v", false),
            ("ctrl", false),
        ]
        .iter()
        .map(|(k, d)| ((*k).to_string(), *d))
        .collect();
        assert_eq!(events, expected);
    }

    #[test]
    fn modifiers_release_in_reverse_order() {
        let events = flat("ctrl+shift+t");
        assert_eq!(
            events,
            vec![
                ("ctrl".to_string(), true),
                ("shift".to_string(), true),
                ("t".to_string(), true),
                ("t".to_string(), false),
                ("shift".to_string(), false),
                ("ctrl".to_string(), false),
            ]
        );
    }

    #[test]
    fn bare_key_presses_and_releases() {
        assert_eq!(
            flat("enter"),
            vec![("enter".to_string(), true), ("enter".to_string(), false)]
        );
    }

    #[test]
    fn aliases_normalize_to_super() {
        for alias in ["win+l", "cmd+l", "meta+l", "super+l"] {
            assert_eq!(flat(alias)[0].0, "super");
        }
    }

    #[test]
    fn whitespace_and_empty_chords_are_ignored() {
        assert!(parse("   ").is_empty());
        assert_eq!(parse("  ctrl+c   esc ").len(), 2);
    }
}
