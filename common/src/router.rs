use std::collections::HashMap;

use crate::topics::TopicSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Poll,
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    routes: HashMap<String, Route>,
}

impl MessageRouter {
    pub fn new(topics: &TopicSet, honor_disconnect: bool) -> Self {
        let mut router = Self::default();
        router.register(topics.poll.clone(), Route::Poll);
        if honor_disconnect {
            router.register(topics.disconnect.clone(), Route::Disconnect);
        }
        router
    }

    pub fn register(&mut self, topic: String, route: Route) -> Option<Route> {
        self.routes.insert(topic, route)
    }

    /// Exact byte match; a topic that is not valid UTF-8 can never match.
    pub fn route(&self, topic: &[u8]) -> Option<Route> {
        let topic = std::str::from_utf8(topic).ok()?;
        self.routes.get(topic).copied()
    }

    pub fn subscriptions(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}
