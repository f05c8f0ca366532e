use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub heartbeat: String,
    pub read: String,
    pub poll: String,
    pub disconnect: String,
}

impl TopicSet {
    pub fn derive(base: &str, id: &Uuid) -> Self {
        Self {
            heartbeat: heartbeat_topic(base),
            read: format!("{base}/{id}/read"),
            poll: format!("{base}/{id}/poll"),
            disconnect: format!("{base}/{id}/disconnect"),
        }
    }
}

/// Shared by every node under the same base.
pub fn heartbeat_topic(base: &str) -> String {
    format!("heartbeat/{base}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn known_node_topics() {
        let id = Uuid::parse_str("f3088463-5623-476f-a1b5-ecb49446a443").unwrap();
        let topics = TopicSet::derive("picow", &id);

        assert_eq!(topics.heartbeat, "heartbeat/picow");
        assert_eq!(
            topics.poll,
            "picow/f3088463-5623-476f-a1b5-ecb49446a443/poll"
        );
        assert_eq!(
            topics.read,
            "picow/f3088463-5623-476f-a1b5-ecb49446a443/read"
        );
        assert_eq!(
            topics.disconnect,
            "picow/f3088463-5623-476f-a1b5-ecb49446a443/disconnect"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let id = Uuid::from_u128(7);
        assert_eq!(TopicSet::derive("picow", &id), TopicSet::derive("picow", &id));
    }

    #[test]
    fn distinct_ids_never_share_node_topics() {
        let ids: Vec<Uuid> = (0..64_u128)
            .map(|n| Uuid::from_u128(n.wrapping_mul(0x9e37_79b9_7f4a_7c15)))
            .collect();

        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                let ta = TopicSet::derive("picow", a);
                let tb = TopicSet::derive("picow", b);
                let own = [&ta.read, &ta.poll, &ta.disconnect];
                for topic in [&tb.read, &tb.poll, &tb.disconnect] {
                    assert!(!own.contains(&topic), "{a} and {b} collide on {topic}");
                }
                assert_eq!(ta.heartbeat, tb.heartbeat);
            }
        }
    }
}
