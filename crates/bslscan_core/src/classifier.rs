//! Failure classification for scanner runs.
//!
//! Pure analysis, no file-system writes: the retry controller owns
//! remediation. A timeout, cancellation or launch failure maps to one fixed
//! diagnostic. A non-zero exit gets its exit code mapped to a coarse
//! headline and its combined output matched against a catalogue of known
//! failure signatures, one human-readable diagnostic per match. The BSL
//! tokenization failure is the distinguished retryable class: the offending
//! file paths are extracted so the controller can repair or exclude them.

use crate::invoker::InvokeError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Diagnostic used when no catalogue entry matches a failed run.
pub const FALLBACK_DIAGNOSTIC: &str =
    "scan failed: no specific error patterns detected in scanner output";

/// Operator hints appended whenever the BSL tokenization signature fires.
pub const BSL_REMEDIATION_HINTS: &[&str] = &[
    "check the failing files for encoding artifacts (BOM, CRLF, non-breaking spaces)",
    "add persistently failing files to sonar.exclusions to unblock analysis",
    "verify the installed BSL plugin version matches the scanner",
];

/// `java.lang.IllegalStateException: Tokens of file '<path>' ...` as the
/// BSL plugin prints it when the lexer gives up on a file. Only `.bsl` and
/// `.os` paths count: those are the extensions the repair pass handles, and
/// nothing else belongs in the exclusion ledger.
static RE_TOKEN_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"java\.lang\.IllegalStateException: Tokens of file '([^']+\.(?:bsl|os))'")
        .unwrap()
});

/// Coarse failure class derived from the scanner exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureHeadline {
    /// Exit 1: analysis ran and failed (includes quality gate breaches).
    AnalysisFailure,
    /// Exit 2: the scanner rejected its configuration.
    InvalidConfiguration,
    /// Exit 3: the scanner itself crashed.
    InternalError,
    /// Exit 4: the scanner ran out of a resource (memory, disk, handles).
    ResourceExhaustion,
    /// Any other exit code, or none.
    Unknown,
}

impl FailureHeadline {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            1 => FailureHeadline::AnalysisFailure,
            2 => FailureHeadline::InvalidConfiguration,
            3 => FailureHeadline::InternalError,
            4 => FailureHeadline::ResourceExhaustion,
            _ => FailureHeadline::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureHeadline::AnalysisFailure => "analysis or quality gate failure",
            FailureHeadline::InvalidConfiguration => "invalid scanner configuration",
            FailureHeadline::InternalError => "scanner internal error",
            FailureHeadline::ResourceExhaustion => "resource exhaustion",
            FailureHeadline::Unknown => "unknown failure",
        }
    }
}

/// What kind of problem a diagnostic points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The retryable BSL lexer failure.
    Tokenization,
    Authentication,
    Authorization,
    Network,
    Tls,
    Configuration,
    Sources,
    Scm,
    Plugin,
    Runtime,
    Resource,
    QualityGate,
    Timeout,
    Cancelled,
    Launch,
    Unrecognized,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Tokenization => "tokenization",
            FailureCategory::Authentication => "authentication",
            FailureCategory::Authorization => "authorization",
            FailureCategory::Network => "network",
            FailureCategory::Tls => "tls",
            FailureCategory::Configuration => "configuration",
            FailureCategory::Sources => "sources",
            FailureCategory::Scm => "scm",
            FailureCategory::Plugin => "plugin",
            FailureCategory::Runtime => "runtime",
            FailureCategory::Resource => "resource",
            FailureCategory::QualityGate => "quality_gate",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Cancelled => "cancelled",
            FailureCategory::Launch => "launch",
            FailureCategory::Unrecognized => "unrecognized",
        }
    }
}

/// What the classifier concluded about one failed run.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub headline: FailureHeadline,
    /// Dominant category: tokenization when the retryable signature fired,
    /// otherwise the first matched catalogue entry.
    pub category: FailureCategory,
    /// One line per matched catalogue entry, plus hints, or the fallback.
    pub diagnostics: Vec<String>,
    /// Paths named by the BSL tokenization signature, in first-seen order.
    pub failing_bsl_files: Vec<String>,
}

impl Classification {
    /// True when this failure is the retryable tokenization class.
    pub fn is_bsl_token_failure(&self) -> bool {
        !self.failing_bsl_files.is_empty()
    }

    fn fixed(headline: FailureHeadline, category: FailureCategory, diagnostic: String) -> Self {
        Self {
            headline,
            category,
            diagnostics: vec![diagnostic],
            failing_bsl_files: Vec::new(),
        }
    }
}

/// One known failure signature. All needles must appear (case-insensitive)
/// in the combined output for the rule to fire.
struct DiagnosticRule {
    needles: &'static [&'static str],
    category: FailureCategory,
    message: &'static str,
}

const CATALOGUE: &[DiagnosticRule] = &[
    DiagnosticRule {
        needles: &["outofmemoryerror", "java heap space"],
        category: FailureCategory::Resource,
        message: "scanner JVM ran out of heap; raise -Xmx in SONAR_SCANNER_OPTS",
    },
    DiagnosticRule {
        needles: &["outofmemoryerror", "metaspace"],
        category: FailureCategory::Resource,
        message: "scanner JVM exhausted metaspace; raise -XX:MaxMetaspaceSize",
    },
    DiagnosticRule {
        needles: &["gc overhead limit exceeded"],
        category: FailureCategory::Resource,
        message: "scanner JVM spent most of its time in GC; raise -Xmx or shrink the analyzed set",
    },
    DiagnosticRule {
        needles: &["no space left on device"],
        category: FailureCategory::Resource,
        message: "disk full on the scanner work directory",
    },
    DiagnosticRule {
        needles: &["too many open files"],
        category: FailureCategory::Resource,
        message: "file descriptor limit hit; raise ulimit -n for the scanner process",
    },
    DiagnosticRule {
        needles: &["connection refused"],
        category: FailureCategory::Network,
        message: "SonarQube server refused the connection; check sonar.host.url and that the server is up",
    },
    DiagnosticRule {
        needles: &["unknownhostexception"],
        category: FailureCategory::Network,
        message: "cannot resolve the SonarQube host name; check sonar.host.url and DNS",
    },
    DiagnosticRule {
        needles: &["sockettimeoutexception"],
        category: FailureCategory::Network,
        message: "network timeout talking to the SonarQube server",
    },
    DiagnosticRule {
        needles: &["fail to get bootstrap index"],
        category: FailureCategory::Network,
        message: "cannot fetch the server bootstrap index; sonar.host.url is wrong or the server is down",
    },
    DiagnosticRule {
        needles: &["proxy authentication required"],
        category: FailureCategory::Network,
        message: "the HTTP proxy rejected the scanner; set the sonar.scanner.proxy* credentials",
    },
    DiagnosticRule {
        needles: &["internal server error"],
        category: FailureCategory::Network,
        message: "the SonarQube server answered with an internal error; check the server logs",
    },
    DiagnosticRule {
        needles: &["fail", "upload report"],
        category: FailureCategory::Network,
        message: "uploading the analysis report failed; check server logs and server-side disk space",
    },
    DiagnosticRule {
        needles: &["sslhandshakeexception"],
        category: FailureCategory::Tls,
        message: "TLS handshake with the SonarQube server failed; check the certificate chain",
    },
    DiagnosticRule {
        needles: &["pkix path building failed"],
        category: FailureCategory::Tls,
        message: "server certificate is not trusted by the scanner JVM; import it into the truststore",
    },
    DiagnosticRule {
        needles: &["not authorized"],
        category: FailureCategory::Authentication,
        message: "authentication rejected; check sonar.token / sonar.login",
    },
    DiagnosticRule {
        needles: &["insufficient privileges"],
        category: FailureCategory::Authorization,
        message: "the configured account lacks permission to analyze this project",
    },
    DiagnosticRule {
        needles: &["valid license"],
        category: FailureCategory::Authorization,
        message: "the server edition requires a license this instance does not have",
    },
    DiagnosticRule {
        needles: &["you must define the following mandatory properties"],
        category: FailureCategory::Configuration,
        message: "mandatory analysis properties are missing; define the keys the scanner lists",
    },
    DiagnosticRule {
        needles: &["is not a valid project or module key"],
        category: FailureCategory::Configuration,
        message: "sonar.projectKey is malformed; allowed are letters, digits, '-', '_', '.' and ':'",
    },
    DiagnosticRule {
        needles: &["date of analysis cannot be older"],
        category: FailureCategory::Configuration,
        message: "analysis is older than the last one on the server; check the system clock",
    },
    DiagnosticRule {
        needles: &["no files nor directories matching"],
        category: FailureCategory::Sources,
        message: "sonar.sources matches nothing; check the configured source paths",
    },
    DiagnosticRule {
        needles: &["the folder", "does not exist"],
        category: FailureCategory::Sources,
        message: "a configured source folder does not exist under the project base directory",
    },
    DiagnosticRule {
        needles: &["unable to read file"],
        category: FailureCategory::Sources,
        message: "the scanner could not read a source file; check permissions and encoding",
    },
    DiagnosticRule {
        needles: &["not inside a git work tree"],
        category: FailureCategory::Scm,
        message: "SCM blame unavailable; run inside the repository or set sonar.scm.disabled=true",
    },
    DiagnosticRule {
        needles: &["unable to load component"],
        category: FailureCategory::Plugin,
        message: "a scanner plugin failed to load; plugin and server versions are likely incompatible",
    },
    DiagnosticRule {
        needles: &["fail to download", "plugin"],
        category: FailureCategory::Plugin,
        message: "plugin download from the server failed; check connectivity and server plugins",
    },
    DiagnosticRule {
        needles: &["unsupportedclassversionerror"],
        category: FailureCategory::Runtime,
        message: "the scanner needs a newer Java runtime than the one installed",
    },
    DiagnosticRule {
        needles: &["noclassdeffounderror"],
        category: FailureCategory::Runtime,
        message: "a class the scanner needs is missing; the scanner installation is likely broken",
    },
    DiagnosticRule {
        needles: &["quality gate status: failed"],
        category: FailureCategory::QualityGate,
        message: "the project failed its quality gate",
    },
];

/// Classify one failed run.
///
/// Timeout, cancellation and launch failures each produce a single fixed
/// diagnostic and skip the catalogue; there is no output worth mining and
/// none of them is retryable. Only `Exit` runs the full analysis.
pub fn classify(failure: &InvokeError) -> Classification {
    let headline = FailureHeadline::from_exit_code(failure.exit_code());
    match failure {
        InvokeError::Start(source) => Classification::fixed(
            headline,
            FailureCategory::Launch,
            format!("failed to launch scanner: {}", source),
        ),
        InvokeError::Timeout { seconds, .. } => Classification::fixed(
            headline,
            FailureCategory::Timeout,
            format!("scan aborted: scanner exceeded the {}s time limit", seconds),
        ),
        InvokeError::Cancelled { .. } => Classification::fixed(
            headline,
            FailureCategory::Cancelled,
            "scan cancelled before completion".to_string(),
        ),
        InvokeError::Exit { output, .. } => classify_exit(headline, output),
    }
}

fn classify_exit(headline: FailureHeadline, output: &str) -> Classification {
    let failing_bsl_files = extract_failing_bsl_files(output);
    let mut diagnostics = Vec::new();
    let mut category = None;

    let lowered = output.to_lowercase();
    for rule in CATALOGUE {
        if rule.needles.iter().all(|needle| lowered.contains(needle)) {
            diagnostics.push(rule.message.to_string());
            category.get_or_insert(rule.category);
        }
    }

    if !failing_bsl_files.is_empty() {
        category = Some(FailureCategory::Tokenization);
        diagnostics.push(format!(
            "BSL tokenization failed for {} file(s): {}",
            failing_bsl_files.len(),
            failing_bsl_files.join(", ")
        ));
        for hint in BSL_REMEDIATION_HINTS {
            diagnostics.push((*hint).to_string());
        }
    }

    if diagnostics.is_empty() {
        diagnostics.push(FALLBACK_DIAGNOSTIC.to_string());
    }

    Classification {
        headline,
        category: category.unwrap_or(FailureCategory::Unrecognized),
        diagnostics,
        failing_bsl_files,
    }
}

/// Pull the file paths out of every BSL tokenization stack trace in the
/// output, deduplicated in first-seen order.
pub fn extract_failing_bsl_files(output: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for cap in RE_TOKEN_FAILURE.captures_iter(output) {
        let path = cap[1].to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_FAILURE_OUTPUT: &str = "\
INFO: Analyzing module CommonModules
ERROR: Error during SonarScanner execution
java.lang.IllegalStateException: Tokens of file 'src/CommonModules/Обмен/Module.bsl' should not be empty
\tat com.sonar.sslr.impl.Lexer.lex(Lexer.java:84)
\tat org.antlr.v4.runtime.Parser.match(Parser.java:206)
";

    fn exit(code: i32, output: &str) -> InvokeError {
        InvokeError::Exit {
            code,
            output: output.to_string(),
        }
    }

    #[test]
    fn test_headline_follows_exit_code() {
        assert_eq!(
            FailureHeadline::from_exit_code(1),
            FailureHeadline::AnalysisFailure
        );
        assert_eq!(
            FailureHeadline::from_exit_code(2),
            FailureHeadline::InvalidConfiguration
        );
        assert_eq!(
            FailureHeadline::from_exit_code(3),
            FailureHeadline::InternalError
        );
        assert_eq!(
            FailureHeadline::from_exit_code(4),
            FailureHeadline::ResourceExhaustion
        );
        assert_eq!(FailureHeadline::from_exit_code(7), FailureHeadline::Unknown);
        assert_eq!(FailureHeadline::from_exit_code(-1), FailureHeadline::Unknown);
    }

    #[test]
    fn test_token_failure_paths_are_extracted() {
        let files = extract_failing_bsl_files(TOKEN_FAILURE_OUTPUT);
        assert_eq!(files, vec!["src/CommonModules/Обмен/Module.bsl"]);
    }

    #[test]
    fn test_repeated_token_failures_deduplicate_in_order() {
        let output = "\
java.lang.IllegalStateException: Tokens of file 'a/First.bsl' should not be empty
java.lang.IllegalStateException: Tokens of file 'b/Second.os' should not be empty
java.lang.IllegalStateException: Tokens of file 'a/First.bsl' should not be empty
";
        let files = extract_failing_bsl_files(output);
        assert_eq!(files, vec!["a/First.bsl", "b/Second.os"]);
    }

    #[test]
    fn test_token_extraction_requires_a_bsl_extension() {
        let output =
            "java.lang.IllegalStateException: Tokens of file '/etc/passwd.txt' should not be empty\n";
        assert!(extract_failing_bsl_files(output).is_empty());

        // Without an extractable file the failure is not the retryable
        // class, whatever the message says.
        let classification = classify(&exit(1, output));
        assert!(!classification.is_bsl_token_failure());
        assert_eq!(classification.category, FailureCategory::Unrecognized);
        assert_eq!(
            classification.diagnostics,
            vec![FALLBACK_DIAGNOSTIC.to_string()]
        );
    }

    #[test]
    fn test_token_failure_classification_carries_hints() {
        let classification = classify(&exit(1, TOKEN_FAILURE_OUTPUT));
        assert!(classification.is_bsl_token_failure());
        assert_eq!(classification.headline, FailureHeadline::AnalysisFailure);
        assert_eq!(classification.category, FailureCategory::Tokenization);
        assert_eq!(
            classification.failing_bsl_files,
            vec!["src/CommonModules/Обмен/Module.bsl"]
        );
        assert!(classification
            .diagnostics
            .iter()
            .any(|d| d.contains("BSL tokenization failed for 1 file(s)")));
        for hint in BSL_REMEDIATION_HINTS {
            assert!(classification.diagnostics.iter().any(|d| d == hint));
        }
    }

    #[test]
    fn test_known_signature_maps_to_catalogue_diagnostic() {
        let classification = classify(&exit(4, "ERROR: java.lang.OutOfMemoryError: Java heap space"));
        assert_eq!(classification.headline, FailureHeadline::ResourceExhaustion);
        assert_eq!(classification.category, FailureCategory::Resource);
        assert_eq!(classification.diagnostics.len(), 1);
        assert!(classification.diagnostics[0].contains("ran out of heap"));
        assert!(!classification.is_bsl_token_failure());
    }

    #[test]
    fn test_multiple_signatures_yield_multiple_diagnostics() {
        let output = "\
ERROR: SonarQube server [http://sonar.local] can not be reached
ERROR: Connection refused
ERROR: java.net.UnknownHostException: sonar.local
";
        let classification = classify(&exit(2, output));
        assert_eq!(classification.diagnostics.len(), 2);
        assert!(classification.diagnostics[0].contains("refused the connection"));
        assert!(classification.diagnostics[1].contains("cannot resolve"));
        assert_eq!(classification.category, FailureCategory::Network);
    }

    #[test]
    fn test_unrecognized_output_yields_single_fallback_line() {
        let classification = classify(&exit(1, "something exploded mysteriously"));
        assert_eq!(
            classification.diagnostics,
            vec![FALLBACK_DIAGNOSTIC.to_string()]
        );
        assert_eq!(classification.category, FailureCategory::Unrecognized);
        assert!(!classification.is_bsl_token_failure());
    }

    #[test]
    fn test_signature_matching_is_case_insensitive() {
        let classification = classify(&exit(2, "ERROR: NOT AUTHORIZED. Please check the token."));
        assert_eq!(classification.diagnostics.len(), 1);
        assert!(classification.diagnostics[0].contains("authentication rejected"));
        assert_eq!(classification.category, FailureCategory::Authentication);
    }

    #[test]
    fn test_quality_gate_failure_is_recognized() {
        let classification = classify(&exit(1, "INFO: QUALITY GATE STATUS: FAILED - View details"));
        assert!(classification
            .diagnostics
            .iter()
            .any(|d| d.contains("failed its quality gate")));
        assert_eq!(classification.category, FailureCategory::QualityGate);
    }

    #[test]
    fn test_timeout_maps_to_one_fixed_diagnostic() {
        let failure = InvokeError::Timeout {
            seconds: 3600,
            output: TOKEN_FAILURE_OUTPUT.to_string(),
        };
        let classification = classify(&failure);
        assert_eq!(classification.category, FailureCategory::Timeout);
        assert_eq!(classification.headline, FailureHeadline::Unknown);
        assert_eq!(
            classification.diagnostics,
            vec!["scan aborted: scanner exceeded the 3600s time limit".to_string()]
        );
        // Even with the signature in the partial output a timeout never retries.
        assert!(!classification.is_bsl_token_failure());
    }

    #[test]
    fn test_cancellation_maps_to_one_fixed_diagnostic() {
        let failure = InvokeError::Cancelled {
            output: String::new(),
        };
        let classification = classify(&failure);
        assert_eq!(classification.category, FailureCategory::Cancelled);
        assert_eq!(
            classification.diagnostics,
            vec!["scan cancelled before completion".to_string()]
        );
    }

    #[test]
    fn test_launch_failure_maps_to_one_fixed_diagnostic() {
        let failure = InvokeError::Start(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let classification = classify(&failure);
        assert_eq!(classification.category, FailureCategory::Launch);
        assert_eq!(classification.diagnostics.len(), 1);
        assert!(classification.diagnostics[0].contains("failed to launch scanner"));
    }
}
