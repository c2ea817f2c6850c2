/// Labels attached to every metric emitted for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionLabels {
    pub transport: String,
    pub conversation_id: Option<String>,
    pub extra: Vec<(&'static str, String)>,
}

impl SessionLabels {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            conversation_id: None,
            extra: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<&str>) -> Self {
        self.conversation_id = conversation_id.map(str::to_string);
        self
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.extra.push((key, value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = Vec::with_capacity(2 + self.extra.len());
        tags.push(("transport", self.transport.clone()));
        tags.push((
            "conversation",
            self.conversation_id.clone().unwrap_or_else(|| "-".into()),
        ));
        tags.extend(self.extra.iter().cloned());
        tags
    }
}

pub fn record_counter(name: &'static str, value: u64, labels: &SessionLabels) {
    let tags = labels.tags();
    ::metrics::counter!(name, &tags).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &SessionLabels) {
    let tags = labels.tags();
    ::metrics::histogram!(name, &tags).record(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &SessionLabels) {
    let tags = labels.tags();
    ::metrics::gauge!(name, &tags).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_include_transport_and_conversation() {
        let labels = SessionLabels::new("directline")
            .with_conversation(Some("conv-1"))
            .with("category", "network");
        assert_eq!(
            labels.tags(),
            vec![
                ("transport", "directline".to_string()),
                ("conversation", "conv-1".to_string()),
                ("category", "network".to_string()),
            ]
        );
    }

    #[test]
    fn recorders_accept_labels_without_installed_recorder() {
        let labels = SessionLabels::new("memory");
        record_counter("webchat_client_test_total", 1, &labels);
        record_histogram("webchat_client_test_seconds", 0.5, &labels);
        record_gauge("webchat_client_test_gauge", 2.0, &labels);
    }
}
