//! IMAP transport and session operations
//!
//! Thin wrappers over `async-imap` in which every network step runs under a
//! `tokio` timeout taken from [`SyncConfig`]. Connections are TLS-only.
//! Failures map to the connection class of [`AppError`]: `Timeout` when a
//! bound elapses, `AuthFailed` when LOGIN is refused, `Connection` otherwise.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{AccountConfig, SyncConfig};
use crate::errors::{AppError, AppResult};

/// Authenticated IMAP session over TLS
pub type ImapSession = Session<TlsStream<TcpStream>>;

/// Await `fut` for at most `limit`, naming `step` in any error
async fn bounded<T, E: Display>(
    limit: Duration,
    step: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> AppResult<T> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::Connection(format!("{step} failed: {e}"))),
        Err(_) => Err(AppError::Timeout(format!(
            "{step} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS connection, read the greeting and LOGIN
///
/// TCP connect is bounded by `connect_timeout_ms`; handshake, greeting and
/// LOGIN each by `greeting_timeout_ms`.
///
/// # Errors
///
/// - `InvalidInput` if the account is not `secure` or the host is not a
///   valid TLS server name
/// - `Timeout`, `AuthFailed` or `Connection` as described in the module docs
pub async fn connect_authenticated(
    config: &SyncConfig,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::invalid(format!(
            "account '{}' is not secure; plaintext IMAP is refused",
            account.account_id
        )));
    }
    let server_name = ServerName::try_from(account.host.clone()).map_err(|_| {
        AppError::invalid(format!("'{}' is not a valid TLS server name", account.host))
    })?;

    let connect_limit = Duration::from_millis(config.connect_timeout_ms);
    let greeting_limit = Duration::from_millis(config.greeting_timeout_ms);

    let tcp = bounded(
        connect_limit,
        "tcp connect",
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await?;
    let tls = bounded(
        greeting_limit,
        "TLS handshake",
        tls_connector().connect(server_name, tcp),
    )
    .await?;

    let mut client = Client::new(tls);
    if bounded(greeting_limit, "IMAP greeting", client.read_response())
        .await?
        .is_none()
    {
        return Err(AppError::Connection(
            "server closed the connection before greeting".to_owned(),
        ));
    }

    let login = client.login(account.user.as_str(), account.pass.expose_secret());
    match timeout(greeting_limit, login).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err((ImapError::No(reason) | ImapError::Bad(reason), _))) => {
            Err(AppError::AuthFailed(reason))
        }
        Ok(Err((e, _))) => Err(AppError::Connection(format!("LOGIN failed: {e}"))),
        Err(_) => Err(AppError::Timeout("LOGIN timed out".to_owned())),
    }
}

/// Open `mailbox` read-only with `EXAMINE`
///
/// Fetching bodies in an examined mailbox never sets `\Seen`. The name is
/// sent as IMAP modified UTF-7. Returns the mailbox `UIDVALIDITY`, if any.
pub async fn select_mailbox_readonly(
    config: &SyncConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<Option<u32>> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    let step = format!("EXAMINE '{mailbox}'");
    let selected = bounded(socket_timeout(config), &step, session.examine(&encoded)).await?;
    Ok(selected.uid_validity)
}

/// Run `UID FETCH` and collect every response
///
/// Issuing the command and draining the response stream are bounded
/// separately by `socket_timeout_ms`.
pub async fn uid_fetch(
    config: &SyncConfig,
    session: &mut ImapSession,
    sequence_set: &str,
    query: &str,
) -> AppResult<Vec<Fetch>> {
    let limit = socket_timeout(config);
    let responses = bounded(limit, "UID FETCH", session.uid_fetch(sequence_set, query)).await?;
    bounded(limit, "UID FETCH stream", responses.try_collect::<Vec<_>>()).await
}

pub async fn logout(config: &SyncConfig, session: &mut ImapSession) -> AppResult<()> {
    bounded(socket_timeout(config), "LOGOUT", session.logout()).await
}

fn socket_timeout(config: &SyncConfig) -> Duration {
    Duration::from_millis(config.socket_timeout_ms)
}

/// Flags of a fetch response as IMAP atoms (`\Seen`, `$Junk`, ...)
pub fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| flag_atom(&flag)).collect()
}

fn flag_atom(flag: &Flag<'_>) -> String {
    let system = match flag {
        Flag::Seen => "Seen",
        Flag::Answered => "Answered",
        Flag::Flagged => "Flagged",
        Flag::Deleted => "Deleted",
        Flag::Draft => "Draft",
        Flag::Recent => "Recent",
        Flag::MayCreate => "*",
        Flag::Custom(keyword) => return keyword.to_string(),
    };
    format!("\\{system}")
}
