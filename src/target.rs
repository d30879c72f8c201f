use std::fmt;

pub const PUBLIC_LINK_BASE: &str = "https://t.me";

/// One channel or group a user has to join before files are released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub raw: String,
    pub check_handle: String,
    pub join_url: Option<String>,
}

impl Target {
    pub fn parse(raw: &str) -> Self {
        let (check_handle, join_url) = split(raw);
        Target {
            raw: raw.trim().to_string(),
            check_handle,
            join_url,
        }
    }

    pub fn needs_invite(&self) -> bool {
        self.join_url.is_none()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.check_handle)
    }
}

/// Splits a target descriptor into the handle used for membership checks and
/// the URL shown on the join button.
///
/// Accepted shapes:
/// - `-100123|https://t.me/+invite` (explicit link)
/// - `@public` (link derived from the username)
/// - `-100123` (no link, an invite link is created on demand)
pub fn split(raw: &str) -> (String, Option<String>) {
    let s = raw.trim();

    if let Some((handle, url)) = s.split_once('|') {
        return (handle.trim().to_string(), Some(url.trim().to_string()));
    }

    if let Some(username) = s.strip_prefix('@') {
        let url = format!("{}/{}", PUBLIC_LINK_BASE, username.trim_start_matches('@'));
        return (s.to_string(), Some(url));
    }

    (s.to_string(), None)
}

pub fn parse_all<I, S>(raws: I) -> Vec<Target>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raws.into_iter()
        .map(|raw| Target::parse(raw.as_ref()))
        .filter(|target| !target.check_handle.is_empty())
        .collect()
}
