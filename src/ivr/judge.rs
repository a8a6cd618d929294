//! Matching of received IVR events against the template

use serde::{Deserialize, Serialize};

use super::{FuzzyPrompts, IvrEvent, IvrEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Judgment {
    Pass,
    Fail,
}

impl Judgment {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "FAIL",
        }
    }
}

/// Judges one received event against the next expected one.
///
/// Record files, system prompts and record tones only need to land on a slot
/// of the same kind. Spoken prompts must match by name, exactly or through the
/// equivalence table.
pub fn smart_judge(expected: Option<&IvrEvent>, actual: &IvrEvent, table: &FuzzyPrompts) -> Judgment {
    let Some(expected) = expected else {
        return Judgment::Fail;
    };
    if expected.kind != actual.kind {
        return Judgment::Fail;
    }

    let passed = match actual.kind {
        IvrEventKind::RecordFile | IvrEventKind::System | IvrEventKind::RecordTone => true,
        IvrEventKind::Speak => {
            expected.content == actual.content
                || prompts_match(table, &expected.content, &actual.content)
        }
    };

    if passed {
        Judgment::Pass
    } else {
        Judgment::Fail
    }
}

/// Name comparison with and without the two character language code.
pub fn prompts_match(table: &FuzzyPrompts, expected: &str, actual: &str) -> bool {
    let expected = prompt_name(expected);
    let actual = prompt_name(actual);

    if table.equivalent(&expected, &actual) {
        return true;
    }

    match (expected.get(2..), actual.get(2..)) {
        (Some(e), Some(a)) if !e.is_empty() && !a.is_empty() => table.equivalent(e, a),
        _ => false,
    }
}

/// File name of a prompt path, lower-cased.
pub fn prompt_name(path: &str) -> String {
    let start = path.rfind(|c| c == '/' || c == '\\').map_or(0, |i| i + 1);
    path[start..].to_lowercase()
}

/// Display form of an event: its short name, and the kind it most likely is.
///
/// Some "speak" entries are really recorded files with generated names full of
/// punctuation; the language code is also dropped from long prompt ids.
pub fn wash_prompt(event: &IvrEvent) -> (IvrEventKind, String) {
    const RECORD_NAME_MARKERS: &str = "!@#$%^&*()-+=";

    let name = prompt_name(&event.content);
    if event.kind != IvrEventKind::Speak {
        return (event.kind, name);
    }

    if name.len() > 8 && name.chars().any(|c| RECORD_NAME_MARKERS.contains(c)) {
        return (IvrEventKind::RecordFile, name);
    }

    let second_is_digit = name.chars().nth(1).map_or(false, |c| c.is_ascii_digit());
    if name.len() > 5 && second_is_digit {
        if let Some(stripped) = name.get(2..) {
            return (IvrEventKind::Speak, stripped.to_string());
        }
    }
    (IvrEventKind::Speak, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speak(name: &str) -> IvrEvent {
        IvrEvent::new(IvrEventKind::Speak, name)
    }

    #[test]
    fn test_language_variants_are_equal() {
        let mut table = FuzzyPrompts::new();
        table.add_group(["ja348.vox", "ja348b.vox"]);
        assert!(prompts_match(&table, "e1ja348.vox", "e2ja348.vox"));
        assert!(prompts_match(&table, "e1ja348.vox", "e2ja348b.vox"));
    }

    #[test]
    fn test_distinct_prompts_are_unequal_without_table() {
        let table = FuzzyPrompts::new();
        assert!(!prompts_match(&table, "e1ja111.vox", "e1ja222.vox"));
        assert_eq!(
            smart_judge(Some(&speak("e1ja111.vox")), &speak("e1ja222.vox"), &table),
            Judgment::Fail
        );
    }

    #[test]
    fn test_path_and_case_are_ignored() {
        let table = FuzzyPrompts::new();
        assert!(prompts_match(&table, "d:\\ivr\\speak.vox\\E1JA348", "/ivr/speak.vox/e1ja348"));
    }

    #[test]
    fn test_speak_exact_match() {
        let table = FuzzyPrompts::new();
        let expected = speak("d:\\ivr\\speak.vox\\E1JA348");
        assert!(smart_judge(Some(&expected), &expected.clone(), &table).is_pass());
    }

    #[test]
    fn test_type_level_events() {
        let table = FuzzyPrompts::new();
        let expected = IvrEvent::new(IvrEventKind::RecordFile, "rec-001.wav");
        let actual = IvrEvent::new(IvrEventKind::RecordFile, "rec-999.wav");
        assert!(smart_judge(Some(&expected), &actual, &table).is_pass());

        let tone = IvrEvent::new(IvrEventKind::RecordTone, "rectone\\beep");
        assert!(!smart_judge(Some(&expected), &tone, &table).is_pass());

        let system = IvrEvent::new(IvrEventKind::System, "system32.vox\\a");
        let other = IvrEvent::new(IvrEventKind::System, "system32.vox\\b");
        assert!(smart_judge(Some(&system), &other, &table).is_pass());
    }

    #[test]
    fn test_nothing_expected_fails() {
        let table = FuzzyPrompts::new();
        assert_eq!(smart_judge(None, &speak("x"), &table), Judgment::Fail);
    }

    #[test]
    fn test_wash_prompt() {
        assert_eq!(
            wash_prompt(&speak("d:\\speak.vox\\E1JA348")),
            (IvrEventKind::Speak, "ja348".to_string())
        );
        assert_eq!(
            wash_prompt(&speak("d:\\speak.vox\\caller-2024(1)")),
            (IvrEventKind::RecordFile, "caller-2024(1)".to_string())
        );
        assert_eq!(
            wash_prompt(&speak("d:\\speak.vox\\hello")),
            (IvrEventKind::Speak, "hello".to_string())
        );
    }
}
