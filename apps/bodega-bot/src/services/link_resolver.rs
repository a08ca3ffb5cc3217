use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkResolverError {
    #[error("subscription response is empty")]
    Empty,
    #[error("no connection links found in subscription content")]
    NoLinks,
}

/// Extracts connection links from a subscription payload. Panels answer
/// either with plain `scheme://...` lines or with the same content wrapped
/// in base64; both are accepted. Duplicates are dropped, order is kept.
pub fn extract_links(raw: &str) -> Result<Vec<String>, LinkResolverError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(LinkResolverError::Empty);
    }

    let decoded = maybe_decode_base64(text);
    let final_text = decoded.as_deref().unwrap_or(text);

    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in final_text.lines() {
        let value = line.trim();
        if value.is_empty() || !value.contains("://") {
            continue;
        }
        if seen.insert(value.to_string()) {
            links.push(value.to_string());
        }
    }

    if links.is_empty() {
        return Err(LinkResolverError::NoLinks);
    }
    Ok(links)
}

/// Groups links into newline-joined blocks for delivery as Telegram messages.
pub fn chunk_links(links: &[String], chunk_size: usize) -> Vec<String> {
    links
        .chunks(chunk_size.max(1))
        .map(|part| part.join("\n"))
        .collect()
}

fn maybe_decode_base64(text: &str) -> Option<String> {
    let candidate: String = text.split_whitespace().collect();
    if candidate.is_empty() || candidate.contains("://") {
        return None;
    }

    let padded = match candidate.len() % 4 {
        0 => candidate,
        rem => format!("{}{}", candidate, "=".repeat(4 - rem)),
    };

    let decoded = STANDARD.decode(padded).ok()?;
    let decoded = String::from_utf8_lossy(&decoded).trim().to_string();
    decoded.contains("://").then_some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_links_pass_through_deduplicated() {
        let raw = "vless://a@h:1?x=1#n\n\nvless://a@h:1?x=1#n\ntrojan://b@h:2#m\n";
        let links = extract_links(raw).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links[0].starts_with("vless://"));
        assert!(links[1].starts_with("trojan://"));
    }

    #[test]
    fn base64_body_is_decoded() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let encoded = STANDARD.encode("vless://a@h:1#one\nss://b@h:2#two");
        let links = extract_links(&encoded).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[1], "ss://b@h:2#two");
    }

    #[test]
    fn unpadded_base64_is_accepted() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let encoded = STANDARD.encode("vmess://payload").trim_end_matches('=').to_string();
        let links = extract_links(&encoded).unwrap();
        assert_eq!(links, vec!["vmess://payload"]);
    }

    #[test]
    fn empty_and_linkless_bodies_error() {
        assert!(matches!(extract_links("  \n "), Err(LinkResolverError::Empty)));
        assert!(matches!(extract_links("just text"), Err(LinkResolverError::NoLinks)));
    }

    #[test]
    fn chunking_splits_on_boundary() {
        let links: Vec<String> = (0..45).map(|i| format!("vless://{}", i)).collect();
        let chunks = chunk_links(&links, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].lines().count(), 20);
        assert_eq!(chunks[2].lines().count(), 5);
    }
}
