use super::PatternSpec;
use super::Severity;

struct Builtin {
    name: &'static str,
    regex: &'static str,
    severity: Severity,
}

const NODE: &[Builtin] = &[
    Builtin {
        name: "node-error",
        regex: r"^\s*(?:Uncaught\s+)?(?P<type>(?:[A-Z]\w*)?Error): (?P<message>.+)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "node-unhandled-rejection",
        regex: r"UnhandledPromiseRejection\w*:?\s*(?P<message>.*)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "npm-err",
        regex: r"^npm (?:ERR!|error)\s*(?P<message>.*)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "node-warning",
        regex: r"^\(node:\d+\) (?P<type>\w*Warning): (?P<message>.+)$",
        severity: Severity::Warning,
    },
];

const PYTHON: &[Builtin] = &[
    Builtin {
        name: "python-traceback",
        regex: r"^Traceback \(most recent call last\):$",
        severity: Severity::Info,
    },
    Builtin {
        name: "python-exception",
        regex: r"^(?P<type>(?:[A-Za-z_]\w*\.)*[A-Z]\w*(?:Error|Exception)): (?P<message>.*)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "python-warning",
        regex: r"^(?P<file>[^:]+\.py):(?P<line>\d+): (?P<type>\w*Warning): (?P<message>.+)$",
        severity: Severity::Warning,
    },
];

const RUST: &[Builtin] = &[
    Builtin {
        name: "rust-compile-error",
        regex: r"^error(?:\[(?P<code>E\d{4})\])?: (?P<message>.+)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "rust-panic",
        regex: r"^thread '(?P<thread>[^']*)' panicked at (?P<location>[^:\s]+:\d+:\d+)?:?\s*(?P<message>.*)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "rust-compile-warning",
        regex: r"^warning(?:\[(?P<code>\w+)\])?: (?P<message>.+)$",
        severity: Severity::Warning,
    },
];

const GO: &[Builtin] = &[
    Builtin {
        name: "go-panic",
        regex: r"^panic: (?P<message>.+)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "go-fatal",
        regex: r"^fatal error: (?P<message>.+)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "go-test-fail",
        regex: r"^--- FAIL: (?P<test>\S+)",
        severity: Severity::Error,
    },
];

const JAVA: &[Builtin] = &[
    Builtin {
        name: "java-exception",
        regex: r#"^(?:Exception in thread "(?P<thread>[^"]+)" )?(?P<type>(?:[a-z_]\w*\.)+[A-Z]\w*(?:Exception|Error))(?:: (?P<message>.*))?$"#,
        severity: Severity::Error,
    },
    Builtin {
        name: "java-caused-by",
        regex: r"^Caused by: (?P<type>[\w.$]+)(?:: (?P<message>.*))?$",
        severity: Severity::Error,
    },
];

const GENERIC: &[Builtin] = &[
    Builtin {
        name: "generic-error",
        regex: r"(?i)\b(?:error|fatal|failed|failure)\b[:\s]+(?P<message>.*)$",
        severity: Severity::Error,
    },
    Builtin {
        name: "generic-warning",
        regex: r"(?i)\b(?:warn|warning)\b[:\s]+(?P<message>.*)$",
        severity: Severity::Warning,
    },
];

/// Language packs in registration order. Earlier packs win on overlap, so the
/// catch-all generic pack comes last.
const PACKS: &[(&str, &[Builtin])] = &[
    ("node", NODE),
    ("python", PYTHON),
    ("rust", RUST),
    ("go", GO),
    ("java", JAVA),
    ("generic", GENERIC),
];

pub fn language_packs() -> impl Iterator<Item = &'static str> {
    PACKS.iter().map(|(language, _)| *language)
}

pub fn builtin_patterns() -> Vec<PatternSpec> {
    PACKS
        .iter()
        .flat_map(|(language, patterns)| {
            patterns.iter().map(move |builtin| PatternSpec {
                name: builtin.name.to_string(),
                regex: builtin.regex.to_string(),
                severity: builtin.severity,
                language: Some((*language).to_string()),
                fields: Default::default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorPattern;
    use pretty_assertions::assert_eq;

    fn matching(line: &str, language: &str) -> Option<String> {
        builtin_patterns()
            .into_iter()
            .filter(|spec| spec.language.as_deref() == Some(language))
            .map(|spec| ErrorPattern::compile(spec).expect("builtin compiles"))
            .find(|pattern| pattern.is_match(line))
            .map(|pattern| pattern.name().to_string())
    }

    #[test]
    fn every_builtin_compiles_with_unique_name() {
        let specs = builtin_patterns();
        let mut names: Vec<_> = specs.iter().map(|spec| spec.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), specs.len());
        for spec in specs {
            ErrorPattern::compile(spec).expect("compiles");
        }
    }

    #[test]
    fn representative_lines_hit_their_pack() {
        let cases = [
            ("node", "TypeError: Cannot read properties of undefined", "node-error"),
            ("node", "npm ERR! code ELIFECYCLE", "npm-err"),
            ("python", "ValueError: invalid literal for int()", "python-exception"),
            ("rust", "error[E0308]: mismatched types", "rust-compile-error"),
            ("rust", "thread 'main' panicked at src/main.rs:4:5:", "rust-panic"),
            ("go", "panic: runtime error: index out of range", "go-panic"),
            (
                "java",
                "Exception in thread \"main\" java.lang.NullPointerException",
                "java-exception",
            ),
            ("generic", "deploy failed: connection refused", "generic-error"),
            ("generic", "WARNING: disk almost full", "generic-warning"),
        ];
        for (language, line, expected) in cases {
            assert_eq!(matching(line, language).as_deref(), Some(expected), "{line}");
        }
        for language in language_packs() {
            assert_eq!(matching("server listening on :3000", language), None);
        }
    }
}
