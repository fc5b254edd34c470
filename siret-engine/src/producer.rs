/// A producer attached to a topic, unique by name.
///
/// Remote producers are the inbound side of cross-cluster replication; a
/// global topic with remote producers still connected is not a GC candidate.
#[derive(Debug, Clone)]
pub struct Producer {
    pub producer_name: String,
    pub remote_cluster: Option<String>,
}

impl Producer {
    pub fn new(producer_name: &str) -> Self {
        Producer {
            producer_name: producer_name.to_string(),
            remote_cluster: None,
        }
    }

    pub fn new_remote(producer_name: &str, remote_cluster: &str) -> Self {
        Producer {
            producer_name: producer_name.to_string(),
            remote_cluster: Some(remote_cluster.to_string()),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote_cluster.is_some()
    }
}
