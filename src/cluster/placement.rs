//! Shard placement across the server roster

use super::TransportError;
use crate::metadata::Server;

use std::collections::{HashMap, HashSet};

/// Choose a server for each of `count` shards of `shard_size` bytes.
///
/// Online servers with room for a shard are used, most free space first.
/// When there are fewer servers than shards the assignment wraps around,
/// always preferring whichever candidate has the most space left after the
/// shards already assigned to it.
pub fn select_storage_servers(
    servers: &[Server],
    shard_size: u64,
    count: usize,
) -> Result<Vec<String>, TransportError> {
    select_excluding(servers, &HashSet::new(), shard_size, count)
}

/// Like [`select_storage_servers`] but avoids `exclude` whenever any other
/// candidate remains, so rebuilt shards spread onto servers that do not
/// already hold part of the blob.
pub fn select_replacement_servers(
    servers: &[Server],
    exclude: &HashSet<String>,
    shard_size: u64,
    count: usize,
) -> Result<Vec<String>, TransportError> {
    select_excluding(servers, exclude, shard_size, count)
}

fn select_excluding(
    servers: &[Server],
    exclude: &HashSet<String>,
    shard_size: u64,
    count: usize,
) -> Result<Vec<String>, TransportError> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let online: Vec<&Server> = servers
        .iter()
        .filter(|s| s.is_online() && s.free_space >= shard_size)
        .collect();
    let preferred: Vec<&Server> = online
        .iter()
        .copied()
        .filter(|s| !exclude.contains(&s.name))
        .collect();
    let candidates = if preferred.is_empty() { online } else { preferred };

    if candidates.is_empty() {
        return Err(TransportError::NoCapacity(format!(
            "no online server can take a {} byte shard",
            shard_size
        )));
    }

    let mut remaining: HashMap<&str, u64> = candidates
        .iter()
        .map(|s| (s.name.as_str(), s.free_space))
        .collect();
    let mut chosen = Vec::with_capacity(count);

    for _ in 0..count {
        // most room left wins; name breaks ties so placement is stable
        let best = candidates
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| remaining.get(name).copied().unwrap_or(0) >= shard_size)
            .max_by(|a, b| {
                let (ra, rb) = (remaining[a], remaining[b]);
                ra.cmp(&rb).then_with(|| b.cmp(a))
            });

        let name = best.ok_or_else(|| {
            TransportError::NoCapacity(format!(
                "cluster ran out of space after placing {} of {} shards",
                chosen.len(),
                count
            ))
        })?;

        if let Some(left) = remaining.get_mut(name) {
            *left = left.saturating_sub(shard_size);
        }
        chosen.push(name.to_string());
    }

    Ok(chosen)
}
