//! Streaming channel address derivation.

use url::Url;

use crate::error::{NotifyError, Result};
use crate::record::Identity;

/// Derive the per-identity channel address from the REST base address.
///
/// `https://host/api` with suffix `/api` becomes
/// `wss://host/ws/notifications/{profile}/?token={token}`.
pub fn channel_url(base_url: &str, path_suffix: &str, identity: &Identity) -> Result<Url> {
    let mut url = Url::parse(base_url)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(NotifyError::config(format!(
                "unsupported base URL scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| NotifyError::config(format!("cannot switch scheme to {scheme}")))?;

    let path = url.path().trim_end_matches('/');
    let suffix = path_suffix.trim_end_matches('/');
    let prefix = if !suffix.is_empty() {
        path.strip_suffix(suffix).unwrap_or(path)
    } else {
        path
    };
    let path = format!(
        "{}/ws/notifications/{}/",
        prefix.trim_end_matches('/'),
        identity.profile_id()
    );
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("token", identity.token());

    Ok(url)
}
