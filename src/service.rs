//! Repository-service refresh: RIS and plugin service fetch plus the
//! repo-reconciliation algorithm that merges a service's repo list into the
//! system's existing set of service-owned repositories.
//!
//! Grounded on
//! `examples/original_source/zypp-logic/zypp/ng/repo/workflows/serviceswf.cc`:
//! `fetchRepoListfromService` (RIS vs. plugin dispatch, `cookies=0` on the
//! RIS URL, stdout/stderr capture for plugins) and `RefreshServiceLogic::
//! execute` (filter by target distro, delete, add, update-in-place, clear
//! the disable list). The original threads all of this through a
//! `RepoManager`; here the reconciliation is a pure function over explicit
//! before/after repo lists so it can be tested without a filesystem-backed
//! repo store.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use regex::Regex;

use crate::error::WorkflowError;
use crate::repo::types::ServiceType;

/// One repository as collected from a service's index (RIS `repoindex.xml`
/// or a plugin's `.repo`-format stdout), already alias-prefixed with the
/// owning service's alias and filtered to the active target distro.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedRepo {
    pub alias: String,
    pub name: String,
    pub enabled: bool,
    pub autorefresh: bool,
    pub priority: i32,
    /// `None` means the service's index didn't restrict this repo to a
    /// particular distro; it survives any filter.
    pub target_distro: Option<String>,
    pub base_urls: Vec<String>,
    /// `Some` only for plugin services; RIS services never carry gpg flags.
    pub gpg_checks: Option<(bool, bool, bool)>,
    pub gpg_key_urls: Vec<String>,
    pub mirrorlist_url: Option<String>,
    pub metalink_url: Option<String>,
}

/// A repository already known to the system as belonging to some service.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRepo {
    pub alias: String,
    pub name: String,
    pub enabled: bool,
    pub autorefresh: bool,
    pub priority: i32,
    pub base_urls: Vec<String>,
    pub gpg_checks: Option<(bool, bool, bool)>,
    pub gpg_key_urls: Vec<String>,
    pub mirrorlist_url: Option<String>,
    pub metalink_url: Option<String>,
}

/// Per-service persisted bookkeeping: user enable/disable requests and the
/// repo-enabled states observed on the last refresh, used to distinguish a
/// service-driven change from a user modification that should be kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub repo_to_enable: HashSet<String>,
    pub repo_to_disable: HashSet<String>,
    pub repo_states: HashMap<String, bool>,
}

/// Forces the enabled state the service last requested, discarding any
/// pending user enable/disable request; mirrors `RefreshService_restoreStatus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub restore_status: bool,
}

/// What the caller must do to the system's repo store to bring it in line
/// with a service's collected repo list. Produced by [`reconcile`].
#[derive(Debug, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub to_remove: Vec<String>,
    pub to_add: Vec<CollectedRepo>,
    pub to_update: Vec<ExistingRepo>,
    pub state: ServiceState,
    /// Whether anything changed that warrants persisting the service record.
    pub modified: bool,
}

/// Keeps only repos whose `target_distro` is unset or matches `target`.
pub fn filter_by_target_distro(collected: &[CollectedRepo], target: &str) -> Vec<CollectedRepo> {
    collected
        .iter()
        .filter(|r| r.target_distro.as_deref().map(|d| d == target).unwrap_or(true))
        .cloned()
        .collect()
}

/// Reconciles `existing` (the system's current repos owned by this service)
/// against `collected` (the freshly fetched, distro-filtered list), in the
/// exact order the spec requires: delete repos the service dropped, add new
/// ones (honouring enable requests), then update surviving repos in place.
pub fn reconcile(
    existing: &[ExistingRepo],
    collected: &[CollectedRepo],
    service_type: ServiceType,
    mut state: ServiceState,
    opts: ReconcileOptions,
) -> ReconcileOutcome {
    let mut modified = false;
    let collected_aliases: HashSet<&str> = collected.iter().map(|r| r.alias.as_str()).collect();

    let mut to_remove = Vec::new();
    for old in existing {
        if collected_aliases.contains(old.alias.as_str()) {
            continue;
        }
        if old.enabled {
            let was_user_disabled_by_service = state.repo_states.get(&old.alias) == Some(&false);
            if was_user_disabled_by_service {
                state.repo_to_enable.insert(old.alias.clone());
                modified = true;
            }
        }
        to_remove.push(old.alias.clone());
    }

    let mut to_add = Vec::new();
    let mut to_update = Vec::new();
    let mut new_repo_states = HashMap::new();

    for repo in collected {
        new_repo_states.insert(repo.alias.clone(), repo.enabled);

        let want_enabled: Option<bool> = if opts.restore_status {
            state.repo_to_enable.remove(&repo.alias);
            None
        } else if state.repo_to_enable.remove(&repo.alias) {
            modified = true;
            Some(true)
        } else if state.repo_to_disable.contains(&repo.alias) {
            Some(false)
        } else {
            None
        };

        match existing.iter().find(|o| o.alias == repo.alias) {
            None => {
                let mut repo = repo.clone();
                if let Some(enabled) = want_enabled {
                    repo.enabled = enabled;
                }
                to_add.push(repo);
            }
            Some(old) => {
                let resolved_enabled = match want_enabled {
                    Some(e) => e,
                    None => {
                        if old.enabled == repo.enabled {
                            repo.enabled
                        } else if opts.restore_status {
                            repo.enabled
                        } else {
                            let last = state.repo_states.get(&repo.alias);
                            match last {
                                Some(&last_enabled) if last_enabled == repo.enabled => old.enabled,
                                _ => repo.enabled,
                            }
                        }
                    }
                };

                let mut updated = old.clone();
                let mut changed = false;
                if updated.enabled != resolved_enabled {
                    updated.enabled = resolved_enabled;
                    changed = true;
                }
                if updated.name != repo.name {
                    updated.name = repo.name.clone();
                    changed = true;
                }
                if updated.autorefresh != repo.autorefresh {
                    updated.autorefresh = repo.autorefresh;
                    changed = true;
                }
                if updated.priority != repo.priority {
                    updated.priority = repo.priority;
                    changed = true;
                }
                if updated.base_urls != repo.base_urls {
                    updated.base_urls = repo.base_urls.clone();
                    changed = true;
                }
                if service_type == ServiceType::Plugin && updated.gpg_checks != repo.gpg_checks {
                    updated.gpg_checks = repo.gpg_checks;
                    changed = true;
                }
                if updated.gpg_key_urls != repo.gpg_key_urls {
                    updated.gpg_key_urls = repo.gpg_key_urls.clone();
                    changed = true;
                }
                if updated.mirrorlist_url != repo.mirrorlist_url {
                    updated.mirrorlist_url = repo.mirrorlist_url.clone();
                    changed = true;
                }
                if updated.metalink_url != repo.metalink_url {
                    updated.metalink_url = repo.metalink_url.clone();
                    changed = true;
                }

                if changed {
                    to_update.push(updated);
                }
            }
        }
    }

    if !state.repo_to_disable.is_empty() {
        state.repo_to_disable.clear();
        modified = true;
    }
    if state.repo_states != new_repo_states {
        state.repo_states = new_repo_states;
        modified = true;
    }
    if !to_remove.is_empty() || !to_add.is_empty() || !to_update.is_empty() {
        modified = true;
    }

    ReconcileOutcome { to_remove, to_add, to_update, state, modified }
}

/// Fetches the raw bytes of a RIS `repo/repoindex.xml`, or a plugin script's
/// stdout/stderr. Kept as a trait so the refresh workflow can be exercised
/// without a real medium or subprocess.
pub trait ServiceFetcher {
    /// `cookies=0` is appended to the URL by the caller before this is
    /// invoked, per bnc#573897.
    fn fetch_repoindex(&self, url: &url::Url) -> Result<Vec<u8>, WorkflowError>;

    /// Returns `(exit_code, stdout, stderr)`. A nonzero exit code is not
    /// itself a hard error: the caller turns it into an informal one.
    fn run_plugin(&self, script: &Path) -> Result<(i32, Vec<u8>, Vec<u8>), WorkflowError>;
}

/// `<repoindex ttl="3600"><repo alias="..." name="..." enabled="1" autorefresh="1"
/// priority="99" distro_target="..."><url>https://...</url></repo>...</repoindex>`
fn parse_repoindex(xml: &[u8]) -> (Option<u64>, Vec<CollectedRepo>) {
    let text = String::from_utf8_lossy(xml);

    let ttl_re = Regex::new(r#"<repoindex\b[^>]*\bttl="(\d+)""#).unwrap();
    let ttl = ttl_re.captures(&text).and_then(|c| c[1].parse().ok());

    let repo_re = Regex::new(r#"(?s)<repo\b([^>]*)>(.*?)</repo>"#).unwrap();
    let url_re = Regex::new(r#"(?s)<url[^>]*>\s*([^<\s][^<]*?)\s*</url>"#).unwrap();
    let attr = |attrs: &str, name: &str| -> Option<String> {
        let re = Regex::new(&format!(r#"\b{name}="([^"]*)""#)).unwrap();
        re.captures(attrs).map(|c| c[1].to_string())
    };

    let mut repos = Vec::new();
    for caps in repo_re.captures_iter(&text) {
        let attrs = &caps[1];
        let body = &caps[2];
        let Some(alias) = attr(attrs, "alias") else { continue };
        let base_urls = url_re.captures_iter(body).map(|c| c[1].to_string()).collect();
        repos.push(CollectedRepo {
            alias,
            name: attr(attrs, "name").unwrap_or_default(),
            enabled: attr(attrs, "enabled").map(|v| v == "1").unwrap_or(true),
            autorefresh: attr(attrs, "autorefresh").map(|v| v == "1").unwrap_or(true),
            priority: attr(attrs, "priority").and_then(|v| v.parse().ok()).unwrap_or(99),
            target_distro: attr(attrs, "distro_target").filter(|s| !s.is_empty()),
            base_urls,
            gpg_checks: None,
            gpg_key_urls: Vec::new(),
            mirrorlist_url: None,
            metalink_url: None,
        });
    }
    (ttl, repos)
}

/// `.repo`-format INI text: `[alias]` section headers, `key=value` lines.
fn parse_repo_file(text: &[u8]) -> Vec<CollectedRepo> {
    let text = String::from_utf8_lossy(text);
    let mut repos = Vec::new();
    let mut current: Option<CollectedRepo> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(alias) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(repo) = current.take() {
                repos.push(repo);
            }
            current = Some(CollectedRepo {
                alias: alias.to_string(),
                name: String::new(),
                enabled: true,
                autorefresh: true,
                priority: 99,
                target_distro: None,
                base_urls: Vec::new(),
                gpg_checks: Some((true, true, true)),
                gpg_key_urls: Vec::new(),
                mirrorlist_url: None,
                metalink_url: None,
            });
            continue;
        }
        let Some(repo) = current.as_mut() else { continue };
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim();
        match key {
            "name" => repo.name = value.to_string(),
            "enabled" => repo.enabled = value == "1",
            "autorefresh" => repo.autorefresh = value == "1",
            "priority" => repo.priority = value.parse().unwrap_or(99),
            "baseurl" => repo.base_urls.push(strip_credentials(value)),
            "gpgcheck" => set_gpg(repo, 0, value == "1"),
            "repo_gpgcheck" => set_gpg(repo, 1, value == "1"),
            "pkg_gpgcheck" => set_gpg(repo, 2, value == "1"),
            "gpgkey" => repo.gpg_key_urls = value.split_whitespace().map(str::to_string).collect(),
            "mirrorlist" => repo.mirrorlist_url = Some(value.to_string()),
            "metalink" => repo.metalink_url = Some(value.to_string()),
            _ => {}
        }
    }
    if let Some(repo) = current.take() {
        repos.push(repo);
    }
    repos
}

fn set_gpg(repo: &mut CollectedRepo, idx: usize, value: bool) {
    let mut checks = repo.gpg_checks.unwrap_or((true, true, true));
    match idx {
        0 => checks.0 = value,
        1 => checks.1 = value,
        _ => checks.2 = value,
    }
    repo.gpg_checks = Some(checks);
}

/// Strips a `user:pass@` credential prefix from a URL's authority, per the
/// spec's "base URLs with credentials stripped" update rule.
fn strip_credentials(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut u) => {
            let _ = u.set_username("");
            let _ = u.set_password(None);
            u.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

pub struct ServiceRefreshWorkflow;

impl ServiceRefreshWorkflow {
    /// Fetches and parses a service's repo list, dispatching on
    /// [`ServiceType`]. Returns `(ttl, repos)`; for plugin services `ttl` is
    /// always `None` since plugin output carries no TTL. A nonzero plugin
    /// exit code produces `WorkflowError::ServicePluginInformal` carrying
    /// its stderr, without failing the whole refresh.
    pub fn fetch_repo_list(
        fetcher: &dyn ServiceFetcher,
        service_type: ServiceType,
        url: &url::Url,
        script_path: Option<&Path>,
    ) -> Result<(Option<u64>, Vec<CollectedRepo>), WorkflowError> {
        match service_type {
            ServiceType::Rim => {
                let mut probed = url.clone();
                probed.query_pairs_mut().append_pair("cookies", "0");
                let data = fetcher.fetch_repoindex(&probed)?;
                Ok(parse_repoindex(&data))
            }
            ServiceType::Plugin => {
                let script = script_path
                    .ok_or_else(|| WorkflowError::Repo("plugin service has no script path".to_string()))?;
                let (exit_code, stdout, stderr) = fetcher.run_plugin(script)?;
                if exit_code != 0 {
                    let text = String::from_utf8_lossy(&stderr).into_owned();
                    return Err(WorkflowError::ServicePluginInformal(text));
                }
                Ok((None, parse_repo_file(&stdout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(alias: &str, enabled: bool) -> CollectedRepo {
        CollectedRepo {
            alias: alias.to_string(),
            name: alias.to_string(),
            enabled,
            autorefresh: true,
            priority: 99,
            target_distro: None,
            base_urls: vec!["https://example.com/repo".to_string()],
            gpg_checks: None,
            gpg_key_urls: Vec::new(),
            mirrorlist_url: None,
            metalink_url: None,
        }
    }

    fn existing(alias: &str, enabled: bool) -> ExistingRepo {
        ExistingRepo {
            alias: alias.to_string(),
            name: alias.to_string(),
            enabled,
            autorefresh: true,
            priority: 99,
            base_urls: vec!["https://example.com/repo".to_string()],
            gpg_checks: None,
            gpg_key_urls: Vec::new(),
            mirrorlist_url: None,
            metalink_url: None,
        }
    }

    #[test]
    fn parses_repoindex_ttl_and_repo_urls() {
        let xml = br#"<repoindex ttl="3600">
            <repo alias="main" name="Main Repo" enabled="1" autorefresh="1" priority="50">
                <url>https://mirror.example/repo/main</url>
            </repo>
        </repoindex>"#;
        let (ttl, repos) = parse_repoindex(xml);
        assert_eq!(ttl, Some(3600));
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].alias, "main");
        assert_eq!(repos[0].priority, 50);
        assert_eq!(repos[0].base_urls, vec!["https://mirror.example/repo/main".to_string()]);
    }

    #[test]
    fn repoindex_filters_by_target_distro() {
        let xml = br#"<repoindex ttl="0">
            <repo alias="a" name="A" distro_target="sle-15-x86_64"><url>https://x/a</url></repo>
            <repo alias="b" name="B" distro_target="sle-12-x86_64"><url>https://x/b</url></repo>
        </repoindex>"#;
        let (_, repos) = parse_repoindex(xml);
        let filtered = filter_by_target_distro(&repos, "sle-15-x86_64");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].alias, "a");
    }

    #[test]
    fn parses_plugin_repo_file_sections() {
        let text = b"[main]\nname=Main\nenabled=1\nbaseurl=https://u:p@example.com/repo\ngpgcheck=0\n";
        let repos = parse_repo_file(text);
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].base_urls, vec!["https://example.com/repo".to_string()]);
        assert_eq!(repos[0].gpg_checks, Some((false, true, true)));
    }

    #[test]
    fn reconcile_adds_new_repo_from_service() {
        let outcome = reconcile(&[], &[repo("new", true)], ServiceType::Rim, ServiceState::default(), ReconcileOptions::default());
        assert_eq!(outcome.to_add.len(), 1);
        assert!(outcome.to_remove.is_empty());
        assert!(outcome.modified);
    }

    #[test]
    fn reconcile_removes_repo_the_service_dropped() {
        let outcome = reconcile(&[existing("gone", true)], &[], ServiceType::Rim, ServiceState::default(), ReconcileOptions::default());
        assert_eq!(outcome.to_remove, vec!["gone".to_string()]);
        assert!(outcome.modified);
    }

    #[test]
    fn reconcile_keeps_user_disabled_repo_disabled_when_service_unchanged() {
        let mut state = ServiceState::default();
        state.repo_states.insert("main".to_string(), true);
        let outcome = reconcile(
            &[existing("main", false)],
            &[repo("main", true)],
            ServiceType::Rim,
            state,
            ReconcileOptions::default(),
        );
        assert!(outcome.to_update.is_empty() || outcome.to_update[0].enabled == false);
    }

    #[test]
    fn reconcile_follows_service_when_its_request_changed_since_last_refresh() {
        let mut state = ServiceState::default();
        state.repo_states.insert("main".to_string(), false);
        let outcome = reconcile(
            &[existing("main", false)],
            &[repo("main", true)],
            ServiceType::Rim,
            state,
            ReconcileOptions::default(),
        );
        assert_eq!(outcome.to_update.len(), 1);
        assert!(outcome.to_update[0].enabled);
    }

    #[test]
    fn reconcile_honours_pending_enable_request() {
        let mut state = ServiceState::default();
        state.repo_to_enable.insert("main".to_string());
        let outcome = reconcile(
            &[existing("main", false)],
            &[repo("main", false)],
            ServiceType::Rim,
            state,
            ReconcileOptions::default(),
        );
        assert_eq!(outcome.to_update.len(), 1);
        assert!(outcome.to_update[0].enabled);
        assert!(!outcome.state.repo_to_enable.contains("main"));
    }

    #[test]
    fn reconcile_clears_disable_list_every_refresh() {
        let mut state = ServiceState::default();
        state.repo_to_disable.insert("whatever".to_string());
        let outcome = reconcile(&[], &[], ServiceType::Rim, state, ReconcileOptions::default());
        assert!(outcome.state.repo_to_disable.is_empty());
        assert!(outcome.modified);
    }

    #[test]
    fn reconcile_updates_plugin_gpg_flags_but_not_ris() {
        let mut r = repo("main", true);
        r.gpg_checks = Some((false, true, true));
        let mut old = existing("main", true);
        old.gpg_checks = Some((true, true, true));

        let ris = reconcile(&[old.clone()], &[r.clone()], ServiceType::Rim, ServiceState::default(), ReconcileOptions::default());
        assert!(ris.to_update.is_empty());

        let plugin = reconcile(&[old], &[r], ServiceType::Plugin, ServiceState::default(), ReconcileOptions::default());
        assert_eq!(plugin.to_update.len(), 1);
        assert_eq!(plugin.to_update[0].gpg_checks, Some((false, true, true)));
    }

    #[test]
    fn reconcile_updates_base_urls_with_changed_attributes() {
        let mut r = repo("main", true);
        r.base_urls = vec!["https://new.example/repo".to_string()];
        let old = existing("main", true);
        let outcome = reconcile(&[old], &[r], ServiceType::Rim, ServiceState::default(), ReconcileOptions::default());
        assert_eq!(outcome.to_update.len(), 1);
        assert_eq!(outcome.to_update[0].base_urls, vec!["https://new.example/repo".to_string()]);
    }

    #[test]
    fn reconcile_is_a_noop_when_nothing_changed() {
        let mut state = ServiceState::default();
        state.repo_states.insert("main".to_string(), true);
        let outcome = reconcile(&[existing("main", true)], &[repo("main", true)], ServiceType::Rim, state, ReconcileOptions::default());
        assert!(outcome.to_add.is_empty());
        assert!(outcome.to_remove.is_empty());
        assert!(outcome.to_update.is_empty());
        assert!(!outcome.modified);
    }

    struct FakeFetcher {
        repoindex: Vec<u8>,
    }
    impl ServiceFetcher for FakeFetcher {
        fn fetch_repoindex(&self, _url: &url::Url) -> Result<Vec<u8>, WorkflowError> {
            Ok(self.repoindex.clone())
        }
        fn run_plugin(&self, _script: &Path) -> Result<(i32, Vec<u8>, Vec<u8>), WorkflowError> {
            unreachable!("RIS test doesn't run a plugin")
        }
    }

    #[test]
    fn fetch_repo_list_dispatches_ris_and_appends_cookies_param() {
        let fetcher = FakeFetcher {
            repoindex: br#"<repoindex ttl="60"><repo alias="a" name="A"><url>https://x/a</url></repo></repoindex>"#.to_vec(),
        };
        let url = url::Url::parse("https://service.example/repo/repoindex.xml").unwrap();
        let (ttl, repos) = ServiceRefreshWorkflow::fetch_repo_list(&fetcher, ServiceType::Rim, &url, None).unwrap();
        assert_eq!(ttl, Some(60));
        assert_eq!(repos.len(), 1);
    }

    struct FakePlugin {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }
    impl ServiceFetcher for FakePlugin {
        fn fetch_repoindex(&self, _url: &url::Url) -> Result<Vec<u8>, WorkflowError> {
            unreachable!("plugin test doesn't fetch a repoindex")
        }
        fn run_plugin(&self, _script: &Path) -> Result<(i32, Vec<u8>, Vec<u8>), WorkflowError> {
            Ok((self.exit_code, self.stdout.clone(), self.stderr.clone()))
        }
    }

    #[test]
    fn fetch_repo_list_surfaces_plugin_failure_as_informal_error() {
        let fetcher = FakePlugin { exit_code: 1, stdout: Vec::new(), stderr: b"script blew up".to_vec() };
        let url = url::Url::parse("plugin:///usr/lib/service").unwrap();
        let err = ServiceRefreshWorkflow::fetch_repo_list(&fetcher, ServiceType::Plugin, &url, Some(Path::new("/usr/lib/service")))
            .unwrap_err();
        match err {
            WorkflowError::ServicePluginInformal(msg) => assert_eq!(msg, "script blew up"),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn fetch_repo_list_parses_successful_plugin_output() {
        let fetcher = FakePlugin {
            exit_code: 0,
            stdout: b"[main]\nname=Main\nbaseurl=https://example.com/repo\n".to_vec(),
            stderr: Vec::new(),
        };
        let url = url::Url::parse("plugin:///usr/lib/service").unwrap();
        let (ttl, repos) = ServiceRefreshWorkflow::fetch_repo_list(&fetcher, ServiceType::Plugin, &url, Some(Path::new("/usr/lib/service")))
            .unwrap();
        assert_eq!(ttl, None);
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].alias, "main");
    }
}
