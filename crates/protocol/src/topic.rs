//! Maps `stream` frame channels onto publish-sink topics.

/// Topic for a stream frame from the given server.
///
/// `metrics` goes to the flat metrics room; `container:<cid>:logs` routes to
/// a per-container room; anything else falls through to a generic
/// per-channel room. Channel bytes outside `[A-Za-z0-9_-]` are flattened to
/// `_` so agent input can't mint arbitrary topic names.
pub fn stream_topic(server_id: &str, channel: &str) -> String {
    if channel == "metrics" {
        return format!("server_{server_id}_metrics");
    }
    if let Some(rest) = channel.strip_prefix("container:")
        && let Some(cid) = rest.strip_suffix(":logs")
        && !cid.is_empty()
        && !cid.contains(':')
    {
        return format!("server_{server_id}_container_{}_logs", sanitize(cid));
    }
    format!("server_{server_id}_{}", sanitize(channel))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_channel() {
        assert_eq!(stream_topic("7", "metrics"), "server_7_metrics");
    }

    #[test]
    fn container_logs_channel() {
        assert_eq!(
            stream_topic("7", "container:abc123:logs"),
            "server_7_container_abc123_logs"
        );
    }

    #[test]
    fn other_channels_fall_through() {
        assert_eq!(stream_topic("7", "deploy"), "server_7_deploy");
    }

    #[test]
    fn hostile_channel_names_are_flattened() {
        assert_eq!(stream_topic("7", "x/../etc"), "server_7_x____etc");
    }
}
