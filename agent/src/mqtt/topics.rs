//! MQTT topic definitions

use patch_protocol::FileOperation;

/// MQTT topic patterns
pub struct Topics;

impl Topics {
    /// Deployment requests for one branch
    pub fn patch_request(branch_id: &str) -> String {
        format!("branch/{}/PATCH/Application", branch_id)
    }

    /// Patch status events from one branch
    pub fn patch_status(branch_id: &str) -> String {
        format!("server/{}/PATCH/Status", branch_id)
    }

    /// Patch status events from every branch
    pub fn all_patch_status() -> String {
        "server/+/PATCH/Status".to_string()
    }

    /// File operation requests for one branch
    pub fn file_request(branch_id: &str, op: FileOperation) -> String {
        format!("branch/{}/SFTP/{}", branch_id, op.as_str())
    }

    /// Every file operation request for one branch
    pub fn all_file_requests(branch_id: &str) -> String {
        format!("branch/{}/SFTP/+", branch_id)
    }

    /// Terminal file operation result
    pub fn file_response(branch_id: &str, op: FileOperation) -> String {
        format!("server/{}/SFTP/{}Response", branch_id, op.as_str())
    }

    /// File transfer progress
    pub fn file_progress(branch_id: &str, op: FileOperation) -> String {
        format!("server/{}/SFTP/{}Progress", branch_id, op.as_str())
    }

    /// Retained ONLINE/OFFLINE presence, also the last-will topic
    pub fn service_status(branch_id: &str) -> String {
        format!("server/{}/STATUS/ServiceStatus", branch_id)
    }

    /// Presence of every branch
    pub fn all_service_status() -> String {
        "server/+/STATUS/ServiceStatus".to_string()
    }

    /// Extract the branch ID from a `branch/{id}/...` or `server/{id}/...` topic
    pub fn parse_branch_id(topic: &str) -> Option<String> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() >= 3 && (parts[0] == "branch" || parts[0] == "server") && !parts[1].is_empty() {
            Some(parts[1].to_string())
        } else {
            None
        }
    }

    /// File operation addressed by a `branch/{id}/SFTP/{op}` topic
    pub fn parse_file_operation(topic: &str) -> Option<FileOperation> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["branch", _, "SFTP", op] => FileOperation::from_segment(op),
            _ => None,
        }
    }

    /// MQTT wildcard match: `+` matches one level, a trailing `#` matches the rest.
    pub fn matches(pattern: &str, topic: &str) -> bool {
        let mut pattern_levels = pattern.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (pattern_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(p), Some(t)) if p == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}
