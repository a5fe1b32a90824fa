//! Repo registry construction from repeated `name=value` CLI flags.
//!
//! Every repo-valued flag carries a `<repo>=<payload>` payload. The registry
//! is assembled once at startup, validated, and shared read-only for the
//! lifetime of the process.

use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use url::Url;

/// Repo names are restricted so they are always safe as a path component.
static REPO_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.\-]+$").expect("repo name regex"));

// ---------------------------------------------------------------------------
// Registry types
// ---------------------------------------------------------------------------

/// Which enumeration dialect the prefetcher speaks against a repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    /// Recursive HTML index crawl (Apache/nginx style directory listings).
    Generic,
    /// Sonatype Nexus assets REST API with continuation-token pagination.
    Nexus,
}

/// Prefetch configuration for one repo.
#[derive(Debug, Clone)]
pub struct Prefetch {
    pub mode: PrefetchMode,
    /// Listing base URL; query parameters are allowed here.
    pub base: String,
}

/// Immutable per-repo configuration.
#[derive(Debug, Clone)]
pub struct Repo {
    pub name: String,
    /// URL prefix prepended to the client-supplied filename on miss.
    pub upstream_base: String,
    /// Zero disables garbage collection for this repo.
    pub gc_max_age: Duration,
    pub prefetch: Option<Prefetch>,
    /// A file passes when the list is empty or at least one pattern matches.
    pub include: Vec<Regex>,
    /// An exclude match always wins over an include match.
    pub exclude: Vec<Regex>,
}

/// Raw repeated flag payloads, exactly as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RepoFlags {
    pub upstream_url: Vec<String>,
    pub prefetch: Vec<String>,
    pub prefetch_include: Vec<String>,
    pub prefetch_exclude: Vec<String>,
    pub gc_max_age: Vec<String>,
}

// ---------------------------------------------------------------------------
// Flag payload parsing
// ---------------------------------------------------------------------------

/// Split a `<repo>=<value>` payload and validate the repo name.
fn split_flag(value: &str) -> Result<(&str, &str)> {
    let Some((reponame, rest)) = value.split_once('=') else {
        bail!("flag value {value:?} invalid: must contain '='");
    };
    if reponame.is_empty() {
        bail!("flag value {value:?} invalid: repo name is empty");
    }
    if !REPO_NAME_RE.is_match(reponame) {
        bail!("flag value {value:?} invalid: repo name must match [a-zA-Z0-9_.-]+");
    }
    Ok((reponame, rest))
}

/// Validate a repo URL: http/https only, no fragment, resolvable host,
/// explicit port (if any) in 1-65535. Query parameters are rejected unless
/// `allow_query` is set (listing URLs carry them, upstream bases must not).
fn validate_repo_url(raw: &str, allow_query: bool) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("failed to parse URL {raw:?}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("URL {raw:?}: only http and https schemes are supported");
    }
    if !allow_query && url.query().is_some() {
        bail!("URL {raw:?}: query part (after '?') is not allowed");
    }
    if url.fragment().is_some() {
        bail!("URL {raw:?}: fragment part (after '#') is not allowed");
    }
    if let Some(0) = url.port() {
        bail!("URL {raw:?}: port must be in range 1-65535");
    }

    let host = url
        .host_str()
        .with_context(|| format!("URL {raw:?} has no hostname"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let mut addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("could not resolve hostname {host:?}"))?;
    if addrs.next().is_none() {
        bail!("resolving hostname {host:?} gave no addresses");
    }

    Ok(url)
}

// ---------------------------------------------------------------------------
// Registry assembly
// ---------------------------------------------------------------------------

/// Build the immutable repo registry from the raw flag payloads.
///
/// Every repo referenced by a prefetch, filter, or GC flag must have been
/// defined by an `--upstream_url` flag; filters additionally require a
/// prefetch definition for the same repo.
pub fn build_repos(flags: &RepoFlags) -> Result<HashMap<String, Repo>> {
    let mut repos: HashMap<String, Repo> = HashMap::new();

    for payload in &flags.upstream_url {
        let (reponame, rawurl) = split_flag(payload)?;
        if repos.contains_key(reponame) {
            bail!("upstream URL for repo {reponame:?} defined more than once");
        }
        validate_repo_url(rawurl, false)?;
        repos.insert(
            reponame.to_string(),
            Repo {
                name: reponame.to_string(),
                upstream_base: rawurl.to_string(),
                gc_max_age: Duration::ZERO,
                prefetch: None,
                include: Vec::new(),
                exclude: Vec::new(),
            },
        );
    }

    for payload in &flags.prefetch {
        let (reponame, spec) = split_flag(payload)?;
        let Some((mode, base)) = spec.split_once('=') else {
            bail!("--prefetch for repo {reponame:?} must be <repo>=<type>=<base-url>");
        };
        let mode = match mode {
            "generic" => PrefetchMode::Generic,
            "nexus" => PrefetchMode::Nexus,
            other => bail!("--prefetch for repo {reponame:?}: unsupported type {other:?}"),
        };
        validate_repo_url(base, true)?;
        let repo = repos.get_mut(reponame).with_context(|| {
            format!("repo {reponame:?} referenced in --prefetch is not defined by any --upstream_url")
        })?;
        if repo.prefetch.is_some() {
            bail!("prefetch for repo {reponame:?} defined more than once");
        }
        repo.prefetch = Some(Prefetch {
            mode,
            base: base.to_string(),
        });
    }

    for (payloads, which) in [
        (&flags.prefetch_include, "include"),
        (&flags.prefetch_exclude, "exclude"),
    ] {
        for payload in payloads {
            let (reponame, pattern) = split_flag(payload)?;
            if pattern.is_empty() {
                bail!("--prefetch_{which} for repo {reponame:?}: empty regular expression");
            }
            let re = Regex::new(pattern).with_context(|| {
                format!("--prefetch_{which} for repo {reponame:?}: invalid regular expression")
            })?;
            let repo = repos.get_mut(reponame).with_context(|| {
                format!(
                    "repo {reponame:?} referenced in --prefetch_{which} is not defined by any --upstream_url"
                )
            })?;
            if repo.prefetch.is_none() {
                bail!("repo {reponame:?} referenced in --prefetch_{which} has no --prefetch definition");
            }
            match which {
                "include" => repo.include.push(re),
                _ => repo.exclude.push(re),
            }
        }
    }

    // A zero max age is a valid "GC disabled" setting, so duplicates are
    // tracked by repo name rather than by the stored value.
    let mut gc_defined: HashSet<String> = HashSet::new();
    for payload in &flags.gc_max_age {
        let (reponame, age) = split_flag(payload)?;
        let max_age = humantime::parse_duration(age)
            .with_context(|| format!("--gc_max_age for repo {reponame:?}: invalid duration"))?;
        let repo = repos.get_mut(reponame).with_context(|| {
            format!("repo {reponame:?} referenced in --gc_max_age is not defined by any --upstream_url")
        })?;
        if !gc_defined.insert(reponame.to_string()) {
            bail!("gc max age for repo {reponame:?} defined more than once");
        }
        repo.gc_max_age = max_age;
    }

    Ok(repos)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_with_upstream() -> RepoFlags {
        RepoFlags {
            upstream_url: vec!["mynex=http://127.0.0.1/repository/bin".to_string()],
            ..RepoFlags::default()
        }
    }

    #[test]
    fn split_flag_basic() {
        let (name, value) = split_flag("mynex=http://example").unwrap();
        assert_eq!(name, "mynex");
        assert_eq!(value, "http://example");
    }

    #[test]
    fn split_flag_keeps_later_equals_in_value() {
        let (name, value) = split_flag("r=a=b=c").unwrap();
        assert_eq!(name, "r");
        assert_eq!(value, "a=b=c");
    }

    #[test]
    fn split_flag_rejects_missing_equals_and_bad_names() {
        assert!(split_flag("noequals").is_err());
        assert!(split_flag("=value").is_err());
        assert!(split_flag("bad name=x").is_err());
        assert!(split_flag("bad/name=x").is_err());
    }

    #[test]
    fn upstream_url_scheme_query_fragment() {
        assert!(validate_repo_url("http://127.0.0.1/x", false).is_ok());
        assert!(validate_repo_url("ftp://127.0.0.1/x", false).is_err());
        assert!(validate_repo_url("http://127.0.0.1/x?q=1", false).is_err());
        assert!(validate_repo_url("http://127.0.0.1/x#frag", false).is_err());
        // Listing URLs may carry a query.
        assert!(validate_repo_url("http://127.0.0.1/x?repository=bin", true).is_ok());
    }

    #[test]
    fn upstream_url_port_zero_rejected() {
        assert!(validate_repo_url("http://127.0.0.1:0/x", false).is_err());
        assert!(validate_repo_url("http://127.0.0.1:8081/x", false).is_ok());
    }

    #[test]
    fn build_single_repo() {
        let repos = build_repos(&flags_with_upstream()).unwrap();
        assert_eq!(repos.len(), 1);
        let repo = &repos["mynex"];
        assert_eq!(repo.upstream_base, "http://127.0.0.1/repository/bin");
        assert_eq!(repo.gc_max_age, Duration::ZERO);
        assert!(repo.prefetch.is_none());
    }

    #[test]
    fn duplicate_upstream_rejected() {
        let mut flags = flags_with_upstream();
        flags
            .upstream_url
            .push("mynex=http://127.0.0.1/other".to_string());
        assert!(build_repos(&flags).is_err());
    }

    #[test]
    fn prefetch_spec_parsed() {
        let mut flags = flags_with_upstream();
        flags
            .prefetch
            .push("mynex=nexus=http://127.0.0.1/service/rest/v1/assets?repository=bin".to_string());
        let repos = build_repos(&flags).unwrap();
        let prefetch = repos["mynex"].prefetch.as_ref().unwrap();
        assert_eq!(prefetch.mode, PrefetchMode::Nexus);
    }

    #[test]
    fn prefetch_unknown_type_rejected() {
        let mut flags = flags_with_upstream();
        flags
            .prefetch
            .push("mynex=rsync=http://127.0.0.1/listing".to_string());
        assert!(build_repos(&flags).is_err());
    }

    #[test]
    fn prefetch_for_undefined_repo_rejected() {
        let mut flags = flags_with_upstream();
        flags
            .prefetch
            .push("other=generic=http://127.0.0.1/listing".to_string());
        assert!(build_repos(&flags).is_err());
    }

    #[test]
    fn filters_require_prefetch() {
        let mut flags = flags_with_upstream();
        flags.prefetch_include.push(r"mynex=\.jar$".to_string());
        assert!(build_repos(&flags).is_err());

        flags
            .prefetch
            .push("mynex=generic=http://127.0.0.1/listing".to_string());
        let repos = build_repos(&flags).unwrap();
        assert_eq!(repos["mynex"].include.len(), 1);
    }

    #[test]
    fn gc_max_age_duration_units() {
        let mut flags = flags_with_upstream();
        flags.gc_max_age.push("mynex=12h".to_string());
        let repos = build_repos(&flags).unwrap();
        assert_eq!(repos["mynex"].gc_max_age, Duration::from_secs(12 * 3600));

        let mut flags = flags_with_upstream();
        flags.gc_max_age.push("mynex=1h 30m".to_string());
        let repos = build_repos(&flags).unwrap();
        assert_eq!(repos["mynex"].gc_max_age, Duration::from_secs(90 * 60));
    }

    #[test]
    fn gc_max_age_invalid_duration_rejected() {
        let mut flags = flags_with_upstream();
        flags.gc_max_age.push("mynex=fortnight".to_string());
        assert!(build_repos(&flags).is_err());
    }

    #[test]
    fn duplicate_gc_max_age_rejected_even_when_first_is_zero() {
        let mut flags = flags_with_upstream();
        flags.gc_max_age.push("mynex=0s".to_string());
        flags.gc_max_age.push("mynex=1h".to_string());
        assert!(build_repos(&flags).is_err());
    }
}
