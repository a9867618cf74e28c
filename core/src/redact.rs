/// Placeholder substituted for every configured secret.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Scrubs a configured secret set out of text destined for persistence.
///
/// The live terminal stream is never passed through a redactor; only the
/// cumulative output buffer, the transcript tee, and ledger fields are.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Builds a redactor from the supplied secrets, dropping blank entries.
    /// Secrets are applied in the order given, so callers that sort longer
    /// supersets first get them scrubbed before their substrings.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let secrets = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.trim().is_empty())
            .collect();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Replaces every occurrence of each secret with [`REDACTED_PLACEHOLDER`].
    /// Returns the scrubbed text plus whether anything changed.
    pub fn redact(&self, input: &str) -> (String, bool) {
        if self.secrets.is_empty() {
            return (input.to_string(), false);
        }
        let mut out = input.to_string();
        let mut changed = false;
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED_PLACEHOLDER);
                changed = true;
            }
        }
        (out, changed)
    }
}

/// Splits the `OBI_REDACT` environment value into individual secrets.
/// Separators: comma, semicolon, newline, tab, carriage return.
pub fn split_secrets(raw: &str) -> Vec<String> {
    raw.split([',', ';', '\n', '\r', '\t'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
