//! Secret placeholder substitution.
//!
//! The guest only ever handles `$NAME` placeholders; the real values are
//! spliced in here, after the destination host is known and only when the
//! binding's host patterns admit it. A placeholder aimed at any other host
//! blocks the request instead of leaking the value.

use sandnet_stack::{BlockReason, SecretBinding};

use super::head::RequestHead;

/// Replace every occurrence of `needle` in `haystack`.
fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Substitute placeholders in the request head and body in place.
///
/// Returns `Err(SecretOnDisallowedHost)` — and leaves the request unusable —
/// when a placeholder is present but `host` is outside the binding's
/// patterns. The caller must not forward the request in that case.
pub fn substitute(
    head: &mut RequestHead,
    body: &mut Vec<u8>,
    secrets: &[SecretBinding],
    host: &str,
) -> Result<(), BlockReason> {
    for binding in secrets {
        let placeholder = binding.placeholder();
        let needle = placeholder.as_bytes();

        let in_headers = head
            .headers
            .iter()
            .any(|(_, v)| contains(v.as_bytes(), needle));
        let in_body = contains(body, needle);
        if !in_headers && !in_body {
            continue;
        }

        if !binding.allows_host(host) {
            return Err(BlockReason::SecretOnDisallowedHost);
        }

        if in_headers {
            for value in head.headers.iter_mut_values() {
                if value.contains(&placeholder) {
                    *value = value.replace(&placeholder, &binding.value);
                }
            }
        }
        if in_body {
            *body = replace_bytes(body, needle, binding.value.as_bytes());
        }
    }
    Ok(())
}
