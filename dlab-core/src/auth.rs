use std::{env, fmt, fs, str::FromStr};

use anyhow::{Context, Result};
use hf_hub::api::sync::ApiBuilder;
use serde::Serialize;

/// Environment variable the lab reads its hub token from by default.
pub const DEFAULT_TOKEN_VAR: &str = "HUGGING_FACE_WRITE_TOKEN";

/// Repository whose metadata is requested to check a token.
pub const AUTH_PROBE_REPO: &str = "openai/clip-vit-base-patch32";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The source of the HF token.
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(String),
    CacheToken,
    None,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::EnvVar(DEFAULT_TOKEN_VAR.to_string())
    }
}

impl FromStr for TokenSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(2, ':').collect();
        match parts[0] {
            "literal" => parts
                .get(1)
                .map(|&value| TokenSource::Literal(value.to_string()))
                .ok_or_else(|| "Expected a value for 'literal'".to_string()),
            "env" => Ok(TokenSource::EnvVar(
                parts.get(1).unwrap_or(&DEFAULT_TOKEN_VAR).to_string(),
            )),
            "path" => parts
                .get(1)
                .map(|&value| TokenSource::Path(value.to_string()))
                .ok_or_else(|| "Expected a value for 'path'".to_string()),
            "cache" => Ok(TokenSource::CacheToken),
            "none" => Ok(TokenSource::None),
            _ => Err("Invalid token source format".to_string()),
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never echo the secret itself.
            TokenSource::Literal(_) => write!(f, "literal:<redacted>"),
            TokenSource::EnvVar(value) => write!(f, "env:{}", value),
            TokenSource::Path(value) => write!(f, "path:{}", value),
            TokenSource::CacheToken => write!(f, "cache"),
            TokenSource::None => write!(f, "none"),
        }
    }
}

impl TokenSource {
    /// Read the token. Unreadable sources are logged and yield no token.
    pub fn read(&self) -> Option<String> {
        fn skip_token(input: &str) -> Option<String> {
            tracing::debug!(source = %input, "could not read hub token");
            None
        }

        let token = match self {
            TokenSource::Literal(data) => Some(data.clone()),
            TokenSource::EnvVar(envvar) => env::var(envvar).ok().or_else(|| skip_token(envvar)),
            TokenSource::Path(path) => fs::read_to_string(path).ok().or_else(|| skip_token(path)),
            TokenSource::CacheToken => match dirs::home_dir() {
                Some(home) => {
                    let path = home.join(".cache").join("huggingface").join("token");
                    fs::read_to_string(&path)
                        .ok()
                        .or_else(|| skip_token(&path.display().to_string()))
                }
                None => skip_token("~/.cache/huggingface/token"),
            },
            TokenSource::None => None,
        };

        token
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// A hub token, read once when the session is built.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: Option<String>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn from_source(source: &TokenSource) -> Self {
        Self::new(source.read())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Hub tokens are issued with an `hf_` prefix.
    pub fn looks_valid(&self) -> bool {
        self.token.as_deref().is_some_and(|t| t.starts_with("hf_"))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of the one-time authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AuthStatus {
    Authenticated,
    Failed(String),
    Missing,
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => write!(f, "authenticated"),
            Self::Failed(reason) => write!(f, "authentication failed: {reason}"),
            Self::Missing => write!(f, "no token, unauthenticated"),
        }
    }
}

pub trait HubAuthenticator {
    fn authenticate(&self, token: &str) -> Result<()>;
}

/// Checks a token by requesting repository metadata through an authenticated client.
#[derive(Debug, Clone)]
pub struct HfHubAuthenticator {
    probe_repo: String,
}

impl Default for HfHubAuthenticator {
    fn default() -> Self {
        Self {
            probe_repo: AUTH_PROBE_REPO.to_string(),
        }
    }
}

impl HubAuthenticator for HfHubAuthenticator {
    fn authenticate(&self, token: &str) -> Result<()> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .with_token(Some(token.to_string()))
            .build()
            .context("failed to create hf hub API")?;
        api.model(self.probe_repo.clone())
            .info()
            .with_context(|| format!("hub rejected metadata request for {}", self.probe_repo))?;
        Ok(())
    }
}

/// Attempt authentication once. Every outcome is logged; none is fatal.
pub fn authenticate(credentials: &Credentials, authenticator: &dyn HubAuthenticator) -> AuthStatus {
    let Some(token) = credentials.token() else {
        tracing::warn!("no Hugging Face token found, some models may not be accessible");
        return AuthStatus::Missing;
    };
    match authenticator.authenticate(token) {
        Ok(()) => {
            tracing::info!("Hugging Face authentication successful");
            AuthStatus::Authenticated
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "Hugging Face authentication failed");
            AuthStatus::Failed(format!("{e:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    struct CountingAuthenticator {
        calls: Cell<usize>,
        accept: bool,
    }

    impl HubAuthenticator for CountingAuthenticator {
        fn authenticate(&self, _token: &str) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.accept {
                Ok(())
            } else {
                anyhow::bail!("401 unauthorized")
            }
        }
    }

    #[test]
    fn parses_token_sources() {
        assert_eq!(
            "env".parse::<TokenSource>().unwrap(),
            TokenSource::EnvVar(DEFAULT_TOKEN_VAR.to_string())
        );
        assert_eq!(
            "env:MY_TOKEN".parse::<TokenSource>().unwrap(),
            TokenSource::EnvVar("MY_TOKEN".to_string())
        );
        assert_eq!(
            "literal:hf_abc".parse::<TokenSource>().unwrap(),
            TokenSource::Literal("hf_abc".to_string())
        );
        assert_eq!("none".parse::<TokenSource>().unwrap(), TokenSource::None);
        assert!("path".parse::<TokenSource>().is_err());
        assert!("bogus".parse::<TokenSource>().is_err());
    }

    #[test]
    fn literal_tokens_are_not_displayed() {
        let source = TokenSource::Literal("hf_secret".to_string());
        assert!(!source.to_string().contains("hf_secret"));
        let credentials = Credentials::from_source(&source);
        assert!(!format!("{credentials:?}").contains("hf_secret"));
    }

    #[test]
    fn reads_trimmed_token_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  hf_from_file  ").unwrap();
        let source = TokenSource::Path(file.path().display().to_string());
        assert_eq!(source.read().as_deref(), Some("hf_from_file"));
    }

    #[test]
    fn missing_sources_yield_no_token() {
        let source = TokenSource::EnvVar("DLAB_TEST_TOKEN_THAT_IS_NEVER_SET".to_string());
        assert_eq!(source.read(), None);
        assert_eq!(TokenSource::Path("/nonexistent/token".into()).read(), None);
        assert_eq!(TokenSource::Literal("   ".into()).read(), None);
    }

    #[test]
    fn token_format_check() {
        assert!(Credentials::new(Some("hf_abc".into())).looks_valid());
        assert!(!Credentials::new(Some("abc".into())).looks_valid());
        assert!(!Credentials::default().looks_valid());
    }

    #[test]
    fn missing_token_skips_the_hub() {
        let auth = CountingAuthenticator {
            calls: Cell::new(0),
            accept: true,
        };
        assert_eq!(authenticate(&Credentials::default(), &auth), AuthStatus::Missing);
        assert_eq!(auth.calls.get(), 0);
    }

    #[test]
    fn rejected_token_is_not_fatal() {
        let auth = CountingAuthenticator {
            calls: Cell::new(0),
            accept: false,
        };
        let status = authenticate(&Credentials::new(Some("hf_bad".into())), &auth);
        assert!(matches!(status, AuthStatus::Failed(ref reason) if reason.contains("401")));
        assert_eq!(auth.calls.get(), 1);
    }

    #[test]
    fn accepted_token_authenticates() {
        let auth = CountingAuthenticator {
            calls: Cell::new(0),
            accept: true,
        };
        let status = authenticate(&Credentials::new(Some("hf_good".into())), &auth);
        assert_eq!(status, AuthStatus::Authenticated);
    }
}
