//! Parsing of agent-style key sequences such as `"ctrl+a Backspace hello"`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamedKey {
    Enter,
    Escape,
    Tab,
    Space,
    Backspace,
    Delete,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Home,
    End,
    PageUp,
    PageDown,
    Meta,
    Control,
    Alt,
    Shift,
    F(u8),
}

impl NamedKey {
    pub fn from_alias(token: &str) -> Option<Self> {
        let lowered = token.trim().to_lowercase();
        let key = match lowered.as_str() {
            "enter" | "return" => NamedKey::Enter,
            "esc" | "escape" => NamedKey::Escape,
            "tab" => NamedKey::Tab,
            "space" => NamedKey::Space,
            "backspace" => NamedKey::Backspace,
            "delete" | "del" => NamedKey::Delete,
            "up" | "arrowup" => NamedKey::ArrowUp,
            "down" | "arrowdown" => NamedKey::ArrowDown,
            "left" | "arrowleft" => NamedKey::ArrowLeft,
            "right" | "arrowright" => NamedKey::ArrowRight,
            "home" => NamedKey::Home,
            "end" => NamedKey::End,
            "pageup" => NamedKey::PageUp,
            "pagedown" => NamedKey::PageDown,
            "cmd" | "command" | "meta" => NamedKey::Meta,
            "ctrl" | "control" => NamedKey::Control,
            "alt" | "option" => NamedKey::Alt,
            "shift" => NamedKey::Shift,
            other => {
                let number = other.strip_prefix('f')?.parse::<u8>().ok()?;
                if (1..=12).contains(&number) {
                    NamedKey::F(number)
                } else {
                    return None;
                }
            }
        };
        Some(key)
    }

    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            NamedKey::Meta | NamedKey::Control | NamedKey::Alt | NamedKey::Shift
        )
    }

    /// `KeyboardEvent.key` value for synthesised events.
    pub fn dom_key(&self) -> String {
        match self {
            NamedKey::Enter => "Enter".into(),
            NamedKey::Escape => "Escape".into(),
            NamedKey::Tab => "Tab".into(),
            NamedKey::Space => " ".into(),
            NamedKey::Backspace => "Backspace".into(),
            NamedKey::Delete => "Delete".into(),
            NamedKey::ArrowUp => "ArrowUp".into(),
            NamedKey::ArrowDown => "ArrowDown".into(),
            NamedKey::ArrowLeft => "ArrowLeft".into(),
            NamedKey::ArrowRight => "ArrowRight".into(),
            NamedKey::Home => "Home".into(),
            NamedKey::End => "End".into(),
            NamedKey::PageUp => "PageUp".into(),
            NamedKey::PageDown => "PageDown".into(),
            NamedKey::Meta => "Meta".into(),
            NamedKey::Control => "Control".into(),
            NamedKey::Alt => "Alt".into(),
            NamedKey::Shift => "Shift".into(),
            NamedKey::F(n) => format!("F{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyToken {
    Named(NamedKey),
    Text(String),
}

impl KeyToken {
    fn parse(raw: &str) -> Self {
        match NamedKey::from_alias(raw) {
            Some(key) => KeyToken::Named(key),
            None => KeyToken::Text(raw.to_string()),
        }
    }

    pub fn dom_key(&self) -> String {
        match self {
            KeyToken::Named(key) => key.dom_key(),
            KeyToken::Text(text) => text.clone(),
        }
    }
}

/// One press: modifiers held down around a single key or text run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChord {
    pub modifiers: Vec<NamedKey>,
    pub key: KeyToken,
}

impl KeyChord {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            modifiers: Vec::new(),
            key: KeyToken::Text(text.into()),
        }
    }
}

/// Splits on whitespace; `a+b+c` holds every part but the last as a modifier.
pub fn parse_key_sequence(keys: &str) -> Vec<KeyChord> {
    keys.split_whitespace()
        .filter_map(|token| {
            if token.len() > 1 && token.contains('+') {
                let mut parts: Vec<&str> = token.split('+').filter(|p| !p.is_empty()).collect();
                let last = parts.pop()?;
                let modifiers = parts
                    .into_iter()
                    .filter_map(NamedKey::from_alias)
                    .filter(NamedKey::is_modifier)
                    .collect();
                Some(KeyChord {
                    modifiers,
                    key: KeyToken::parse(last),
                })
            } else {
                Some(KeyChord {
                    modifiers: Vec::new(),
                    key: KeyToken::parse(token),
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_and_chords() {
        let chords = parse_key_sequence("cmd+a Backspace hello esc F5");
        assert_eq!(chords.len(), 5);
        assert_eq!(chords[0].modifiers, vec![NamedKey::Meta]);
        assert_eq!(chords[0].key, KeyToken::Text("a".into()));
        assert_eq!(chords[1].key, KeyToken::Named(NamedKey::Backspace));
        assert_eq!(chords[2].key, KeyToken::Text("hello".into()));
        assert_eq!(chords[3].key, KeyToken::Named(NamedKey::Escape));
        assert_eq!(chords[4].key, KeyToken::Named(NamedKey::F(5)));
    }

    #[test]
    fn lone_plus_is_text() {
        let chords = parse_key_sequence("+");
        assert_eq!(chords, vec![KeyChord::text("+")]);
    }

    #[test]
    fn out_of_range_function_key_is_text() {
        assert_eq!(NamedKey::from_alias("f13"), None);
        assert_eq!(NamedKey::from_alias("F12"), Some(NamedKey::F(12)));
    }
}
