//! Cache keys for documentation lookups.
//!
//! A key is `<project signature>:<digest>`. The signature prefix is the
//! durable tier's partition, so dropping a project's partition invalidates
//! every lookup made under its old dependency set.
use blake3::Hasher;

const DEFAULT_PARTITION: &str = "default";

/// Short, stable digest of a project's technology facts. Order-insensitive.
pub fn project_signature<'a>(facts: impl IntoIterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = facts.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Hasher::new();
    for fact in sorted {
        hasher.update(fact.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

/// Key for the documentation of `framework` answering `query` within a
/// project with the given signature.
pub fn doc_cache_key(framework: &str, query: &str, signature: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(framework.as_bytes());
    hasher.update(&[0]);
    hasher.update(query.as_bytes());
    hasher.update(&[0]);
    hasher.update(signature.as_bytes());
    format!("{}:{}", signature, hasher.finalize().to_hex())
}

/// Partition a key belongs to in the durable tier.
pub fn partition_of(key: &str) -> &str {
    match key.split_once(':') {
        Some((partition, _)) if !partition.is_empty() => partition,
        _ => DEFAULT_PARTITION,
    }
}
