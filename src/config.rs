//! Environment-driven configuration for accounts and storage
//!
//! Variables follow `MAIL_SYNC_<SEGMENT>_<KEY>`; an account exists for every
//! `MAIL_SYNC_<SEGMENT>_HOST`. Loading works on a snapshot of the
//! environment so the parsing rules can be exercised without touching the
//! process environment.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// One IMAP account and the user owning it
///
/// The password is a `SecretString` so it never shows up in `Debug` output or
/// logs.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Lowercased segment name (`MAIL_SYNC_WORK_HOST` → `work`)
    pub account_id: String,
    /// Owning user; becomes a directory name under the attachment root
    pub owner: String,
    pub host: String,
    pub port: u16,
    /// Must be `true`; plaintext IMAP is refused at connect time
    pub secure: bool,
    pub user: String,
    pub pass: SecretString,
}

/// Process-wide sync configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Directory holding `store.db`
    pub data_dir: PathBuf,
    /// Root of `<owner>/<message record id>/<file>` attachment paths
    pub attachments_dir: PathBuf,
    /// TCP connect bound
    pub connect_timeout_ms: u64,
    /// Bound for each of TLS handshake, greeting and LOGIN
    pub greeting_timeout_ms: u64,
    /// Bound for each IMAP command after login
    pub socket_timeout_ms: u64,
}

/// Snapshot of environment variables, empty values dropped
struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    fn capture() -> Self {
        // non-unicode entries cannot name or configure an account
        Self::from_pairs(
            env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(
            pairs
                .into_iter()
                .filter(|(_, v)| !v.trim().is_empty())
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> AppResult<String> {
        self.get(key)
            .map(str::to_owned)
            .ok_or_else(|| AppError::invalid(format!("missing required environment variable {key}")))
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> AppResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| AppError::invalid(format!("invalid value for {key}: '{raw}'"))),
        }
    }

    fn flag_or(&self, key: &str, default: bool) -> AppResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool_value(raw)
                .ok_or_else(|| AppError::invalid(format!("invalid boolean for {key}: '{raw}'"))),
        }
    }

    /// Account segments in sorted order, one per `MAIL_SYNC_<SEG>_HOST`
    fn account_segments(&self) -> AppResult<Vec<String>> {
        let host_key = Regex::new(r"^MAIL_SYNC_([A-Z0-9_]+)_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;
        Ok(self
            .0
            .keys()
            .filter_map(|k| host_key.captures(k)?.get(1).map(|m| m.as_str().to_owned()))
            .collect())
    }
}

impl SyncConfig {
    /// Load configuration from the process environment
    ///
    /// Having no accounts is allowed; commands that need one fail on lookup.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a discovered account is incomplete or a value is
    /// malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_SYNC_DEFAULT_HOST=imap.gmail.com
    /// MAIL_SYNC_DEFAULT_USER=user@gmail.com
    /// MAIL_SYNC_DEFAULT_PASS=app-password
    /// MAIL_SYNC_DEFAULT_OWNER=42
    /// MAIL_SYNC_DATA_DIR=/var/lib/mail-sync
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::from_vars(&EnvVars::capture())
    }

    fn from_vars(vars: &EnvVars) -> AppResult<Self> {
        let mut accounts = BTreeMap::new();
        for segment in vars.account_segments()? {
            let account = load_account(vars, &segment)?;
            accounts.insert(account.account_id.clone(), account);
        }

        let data_dir = PathBuf::from(vars.get("MAIL_SYNC_DATA_DIR").unwrap_or("data"));
        let attachments_dir = vars
            .get("MAIL_SYNC_ATTACHMENTS_DIR")
            .map_or_else(|| data_dir.join("attachments"), PathBuf::from);

        Ok(Self {
            accounts,
            data_dir,
            attachments_dir,
            connect_timeout_ms: vars.parse_or("MAIL_SYNC_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: vars.parse_or("MAIL_SYNC_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: vars.parse_or("MAIL_SYNC_SOCKET_TIMEOUT_MS", 300_000)?,
        })
    }

    /// Get account configuration by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| AppError::NotFound(format!("account '{account_id}' is not configured")))
    }
}

fn load_account(vars: &EnvVars, segment: &str) -> AppResult<AccountConfig> {
    let key = |suffix: &str| format!("MAIL_SYNC_{segment}_{suffix}");
    let account_id = segment.to_ascii_lowercase();
    let owner = vars
        .get(&key("OWNER"))
        .map_or_else(|| account_id.clone(), str::to_owned);
    validate_path_segment(&owner, &key("OWNER"))?;

    Ok(AccountConfig {
        host: vars.require(&key("HOST"))?,
        user: vars.require(&key("USER"))?,
        pass: SecretString::new(vars.require(&key("PASS"))?.into()),
        port: vars.parse_or(&key("PORT"), 993)?,
        secure: vars.flag_or(&key("SECURE"), true)?,
        account_id,
        owner,
    })
}

/// Owner ids become directory names, so they must match `[A-Za-z0-9_-]{1,64}`
pub fn validate_path_segment(value: &str, field: &str) -> AppResult<()> {
    let valid_len = (1..=64).contains(&value.len());
    let valid_chars = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(AppError::invalid(format!(
            "{field} must be 1-64 characters of [A-Za-z0-9_-], got '{value}'"
        )))
    }
}

/// `1/true/yes/y/on` or `0/false/no/n/off`, case-insensitive
fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use secrecy::ExposeSecret;

    use super::{EnvVars, SyncConfig, parse_bool_value, validate_path_segment};
    use crate::errors::AppError;

    fn vars(pairs: &[(&str, &str)]) -> EnvVars {
        EnvVars::from_pairs(pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())))
    }

    #[test]
    fn discovers_accounts_with_defaults() {
        let config = SyncConfig::from_vars(&vars(&[
            ("MAIL_SYNC_WORK_HOST", "imap.example.com"),
            ("MAIL_SYNC_WORK_USER", "me@example.com"),
            ("MAIL_SYNC_WORK_PASS", "hunter2"),
            ("UNRELATED_HOST", "ignored"),
        ]))
        .expect("loads");

        assert_eq!(config.accounts.len(), 1);
        let work = config.get_account("work").expect("account");
        assert_eq!(work.owner, "work");
        assert_eq!(work.port, 993);
        assert!(work.secure);
        assert_eq!(work.pass.expose_secret(), "hunter2");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.attachments_dir, PathBuf::from("data/attachments"));
        assert_eq!(config.socket_timeout_ms, 300_000);
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_vars(&vars(&[
            ("MAIL_SYNC_DEFAULT_HOST", "imap.example.com"),
            ("MAIL_SYNC_DEFAULT_USER", "me"),
            ("MAIL_SYNC_DEFAULT_PASS", "pw"),
            ("MAIL_SYNC_DEFAULT_PORT", "1993"),
            ("MAIL_SYNC_DEFAULT_OWNER", "user-42"),
            ("MAIL_SYNC_DATA_DIR", "/var/lib/sync"),
            ("MAIL_SYNC_CONNECT_TIMEOUT_MS", "500"),
        ]))
        .expect("loads");

        let account = config.get_account("default").expect("account");
        assert_eq!(account.port, 1993);
        assert_eq!(account.owner, "user-42");
        assert_eq!(config.attachments_dir, PathBuf::from("/var/lib/sync/attachments"));
        assert_eq!(config.connect_timeout_ms, 500);
    }

    #[test]
    fn incomplete_account_is_invalid_input() {
        let err = SyncConfig::from_vars(&vars(&[
            ("MAIL_SYNC_DEFAULT_HOST", "imap.example.com"),
            ("MAIL_SYNC_DEFAULT_USER", "me"),
            ("MAIL_SYNC_DEFAULT_PASS", "  "),
        ]))
        .expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(ref m) if m.contains("MAIL_SYNC_DEFAULT_PASS")));
    }

    #[test]
    fn malformed_numbers_and_unknown_accounts_are_rejected() {
        let err = SyncConfig::from_vars(&vars(&[("MAIL_SYNC_SOCKET_TIMEOUT_MS", "soon")]))
            .expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));

        let empty = SyncConfig::from_vars(&vars(&[])).expect("no accounts is fine");
        assert!(matches!(empty.get_account("default"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn parse_bool_value_accepts_common_spellings() {
        for truthy in ["1", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }
        for falsy in ["0", "false", " no ", "N", "OFF"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
        for invalid in ["", "2", "maybe"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn owner_must_be_a_single_path_segment() {
        validate_path_segment("user_42", "owner").expect("plain id is valid");
        for bad in ["", "../etc", "a/b", "a b"] {
            let err = validate_path_segment(bad, "owner").expect_err("must fail");
            assert!(err.to_string().contains("owner"));
        }
    }
}
