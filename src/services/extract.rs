//! Pulls a result locator out of free-form provider text.

use reqwest::Url;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// Hosts that serve generated images without a file extension in the path.
const IMAGE_HOSTS: &[&str] = &[
    "oaidalleapiprodscus.blob.core.windows.net",
    "files.oaiusercontent.com",
    "replicate.delivery",
    "storage.googleapis.com",
    "cdn.openai.com",
    "r2.dev",
    "cloudfront.net",
    "imgur.com",
];

/// Hosts models like to invent when they have no real result.
const PLACEHOLDER_HOSTS: &[&str] = &[
    "example.com",
    "example.org",
    "placeholder.com",
    "via.placeholder.com",
    "placehold.co",
    "placehold.it",
    "dummyimage.com",
];

const TOKEN_SEPARATORS: &[char] = &['(', ')', '[', ']', '<', '>', '"', '\'', '`'];
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// First usable image URL in `text`.
///
/// A token qualifies when it parses as an `http(s)` URL, its host is not a
/// placeholder, and either its path ends in an image extension or its host is
/// a known image host. Markdown link syntax and trailing punctuation are
/// stripped before parsing.
pub fn extract_locator(text: &str) -> Option<String> {
    text.split(|c: char| c.is_whitespace() || TOKEN_SEPARATORS.contains(&c))
        .map(|token| token.trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .filter_map(|token| Url::parse(token).ok())
        .find(is_usable)
        .map(String::from)
}

fn is_usable(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if host_matches(host, PLACEHOLDER_HOSTS) {
        return false;
    }
    has_image_extension(url) || host_matches(host, IMAGE_HOSTS)
}

fn has_image_extension(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext))
}

/// Exact match or subdomain of any entry.
pub(crate) fn host_matches(host: &str, domains: &[&str]) -> bool {
    let host = host.to_ascii_lowercase();
    domains.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
