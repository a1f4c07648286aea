//! Route signatures
//!
//! Requests share a bucket when they share a signature: the method plus the
//! path with ids normalized out. Ids directly after a major resource
//! (`channels`, `guilds`, `webhooks`) stay, since the provider limits those
//! per resource.

use reqwest::Method;

const MAJOR_RESOURCES: [&str; 3] = ["channels", "guilds", "webhooks"];

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Bucket key for a request
pub fn bucket_key(method: &Method, path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut key = String::with_capacity(path.len() + 8);
    key.push_str(method.as_str());
    key.push(' ');

    let mut previous: Option<&str> = None;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        key.push('/');
        match previous {
            // Emoji segments of reaction routes share one bucket
            Some("reactions") => {
                key.push_str(":reaction");
                break;
            }
            Some(prev) if MAJOR_RESOURCES.contains(&prev) => key.push_str(segment),
            _ if is_id(segment) => key.push_str(":id"),
            _ => key.push_str(segment),
        }
        previous = Some(segment);
    }

    if key.ends_with(' ') {
        key.push('/');
    }
    key
}
