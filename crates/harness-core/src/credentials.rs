//! Pre-provisioned authentication for simulated users.
//!
//! A pool of cookie strings is loaded once per process, from a file with one
//! string per line or, when that yields nothing, from a single environment
//! variable. Each authenticated user takes a random entry at start.

use rand::seq::SliceRandom;
use rand::Rng;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{error, info, warn};

use crate::client::Session;

/// Attribute names that can appear in a cookie string but are not cookies.
const COOKIE_ATTRIBUTES: &[&str] = &[
    "path", "domain", "expires", "max-age", "secure", "httponly", "samesite", "comment",
    "version", "priority",
];

/// One authenticated session: the raw cookie string and the pairs parsed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    raw: String,
    cookies: Vec<(String, String)>,
}

impl CredentialBundle {
    /// Parse a `name=value; name2=value2` string. Unparseable pairs are dropped.
    pub fn parse(raw: &str) -> Self {
        let cookies = raw
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if !is_cookie_name(name) {
                    return None;
                }
                if COOKIE_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
                    return None;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Self {
            raw: raw.to_string(),
            cookies,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }
}

fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?={}".contains(c))
}

/// Credential bundles available to this process. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    bundles: Vec<CredentialBundle>,
}

impl CredentialPool {
    pub fn new(bundles: Vec<CredentialBundle>) -> Self {
        Self { bundles }
    }

    /// Load from `path`, falling back to the `env_var` environment variable.
    pub fn load(path: impl AsRef<Path>, env_var: &str) -> Self {
        Self::load_with(path, env_var, |name| std::env::var(name).ok())
    }

    /// Load with an explicit environment lookup. `lookup` is called at most once,
    /// and only when the file yields no bundles.
    pub fn load_with<F>(path: impl AsRef<Path>, env_var: &str, lookup: F) -> Self
    where
        F: FnOnce(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let mut bundles = Vec::new();

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                bundles.extend(
                    contents
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(CredentialBundle::parse),
                );
                info!(
                    "Loaded {} credential bundles from {}",
                    bundles.len(),
                    path.display()
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                error!("Failed to read credential file {}: {}", path.display(), e);
            }
        }

        if bundles.is_empty() {
            if let Some(value) = lookup(env_var).filter(|v| !v.trim().is_empty()) {
                bundles.push(CredentialBundle::parse(value.trim()));
                info!("Loaded single credential bundle from {}", env_var);
            }
        }

        Self { bundles }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn bundles(&self) -> &[CredentialBundle] {
        &self.bundles
    }

    /// Uniform pick with replacement; several users may share a bundle.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&CredentialBundle> {
        self.bundles.choose(rng)
    }
}

/// Start hook for authenticated users: apply a random bundle's cookies to the
/// session and set the JSON content type. Without credentials the session stays
/// anonymous so authenticated requests fail on the server side.
pub fn bootstrap_session<R: Rng + ?Sized>(
    pool: &CredentialPool,
    session: &mut Session,
    rng: &mut R,
) -> Option<CredentialBundle> {
    let assigned = match pool.choose(rng) {
        Some(bundle) => {
            for (name, value) in bundle.cookies() {
                session.set_cookie(name.clone(), value.clone());
            }
            info!("User initialized with {} cookies", bundle.cookies().len());
            Some(bundle.clone())
        }
        None => {
            warn!("No credential bundles loaded; authenticated tasks will fail");
            None
        }
    };
    session.set_header("Content-Type", "application/json");
    assigned
}
