/// Canonical form used for cache keys and fuzzy matching: lowercase, strip
/// everything that is not alphanumeric or whitespace, collapse runs of
/// whitespace, trim. Idempotent.
pub fn normalize(text: &str) -> String {
    let filtered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// djb2 over the bytes of a string, 32-bit wrapping. Used purely as a map
/// index; exact hits additionally compare the normalized key to rule out
/// collisions.
pub fn djb2(text: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in text.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

/// Map key for one `(prompt, model)` pair. The model component prevents
/// cross-model contamination.
pub fn cache_key(prompt: &str, model: &str) -> String {
    format!("{:08x}", djb2(&format!("{}|model:{}", normalize(prompt), model)))
}
