//! Access control for the smart HTTP services.
//!
//! `upload-pack` and `receive-pack` are gated by the process-wide switches in
//! [`SmartHttpSettings`].  When `honor_repo_config` is set, a repository's
//! own `http.uploadpack` / `http.receivepack` settings can further restrict a
//! service that is enabled globally; they can never enable a service that is
//! switched off.

use std::path::Path;

use axum::http::{header, HeaderMap};
use tracing::debug;

use crate::config::SmartHttpSettings;
use crate::git;

pub const UPLOAD_PACK: &str = "upload-pack";
pub const RECEIVE_PACK: &str = "receive-pack";

/// Decide whether `rpc` may be served for the repository at `dir`.
///
/// `check_content_type` is set for the POST RPC endpoints, which must carry
/// `Content-Type: application/x-git-<rpc>-request`.
pub async fn has_access(
    settings: &SmartHttpSettings,
    headers: &HeaderMap,
    dir: &Path,
    rpc: &str,
    check_content_type: bool,
) -> bool {
    if check_content_type && !has_request_content_type(headers, rpc) {
        debug!(%rpc, "content type does not match rpc request");
        return false;
    }

    let globally_enabled = match rpc {
        UPLOAD_PACK => settings.upload_pack,
        RECEIVE_PACK => settings.receive_pack,
        _ => return false,
    };

    if !globally_enabled || !settings.honor_repo_config {
        return globally_enabled;
    }

    repo_allows(settings, dir, rpc).await
}

fn has_request_content_type(headers: &HeaderMap, rpc: &str) -> bool {
    let expected = format!("application/x-git-{rpc}-request");
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// Consult `http.<service>` in the repository's git config.
///
/// `upload-pack` stays enabled unless the setting is `false`; `receive-pack`
/// requires an explicit `true`.
async fn repo_allows(settings: &SmartHttpSettings, dir: &Path, rpc: &str) -> bool {
    let key = format!("http.{}", rpc.replace('-', ""));
    let value = git::commands::git_config_get(&settings.git_bin_path, dir, &key).await;
    debug!(%key, ?value, "repository access setting");

    match rpc {
        UPLOAD_PACK => value.as_deref() != Some("false"),
        _ => value.as_deref() == Some("true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    fn settings(upload_pack: bool, receive_pack: bool) -> SmartHttpSettings {
        SmartHttpSettings {
            upload_pack,
            receive_pack,
            ..SmartHttpSettings::default()
        }
    }

    fn rpc_headers(rpc: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("application/x-git-{rpc}-request")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn unknown_rpc_is_always_denied() {
        let s = settings(true, true);
        let dir = Path::new("/nonexistent");
        assert!(!has_access(&s, &HeaderMap::new(), dir, "", false).await);
        assert!(!has_access(&s, &HeaderMap::new(), dir, "archive", false).await);
        assert!(!has_access(&s, &rpc_headers("archive"), dir, "archive", true).await);
    }

    #[tokio::test]
    async fn services_follow_global_switches() {
        let dir = Path::new("/nonexistent");
        for (upload, receive) in [(true, true), (true, false), (false, true), (false, false)] {
            let s = settings(upload, receive);
            let h = HeaderMap::new();
            assert_eq!(has_access(&s, &h, dir, UPLOAD_PACK, false).await, upload);
            assert_eq!(has_access(&s, &h, dir, RECEIVE_PACK, false).await, receive);
        }
    }

    #[tokio::test]
    async fn rpc_requires_matching_content_type() {
        let s = settings(true, true);
        let dir = Path::new("/nonexistent");

        assert!(has_access(&s, &rpc_headers(UPLOAD_PACK), dir, UPLOAD_PACK, true).await);
        assert!(!has_access(&s, &HeaderMap::new(), dir, UPLOAD_PACK, true).await);
        assert!(!has_access(&s, &rpc_headers(RECEIVE_PACK), dir, UPLOAD_PACK, true).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repo_config_can_restrict_enabled_services() {
        use crate::test_support::fake_git;

        let tmp = tempfile::tempdir().unwrap();
        // Stand-in for `git config --get <key>`: only `http.uploadpack` is set.
        let script = fake_git(
            tmp.path(),
            r#"if [ "$3" = "http.uploadpack" ]; then echo false; exit 0; fi; exit 1"#,
        );

        let s = SmartHttpSettings {
            honor_repo_config: true,
            git_bin_path: script,
            ..SmartHttpSettings::default()
        };
        let h = HeaderMap::new();

        // http.uploadpack=false disables fetch.
        assert!(!has_access(&s, &h, tmp.path(), UPLOAD_PACK, false).await);
        // http.receivepack unset: push needs an explicit opt-in.
        assert!(!has_access(&s, &h, tmp.path(), RECEIVE_PACK, false).await);

        // A global switch can never be re-enabled by repository config.
        let off = SmartHttpSettings {
            upload_pack: false,
            ..s
        };
        assert!(!has_access(&off, &h, tmp.path(), UPLOAD_PACK, false).await);
    }
}
