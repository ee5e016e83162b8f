#![no_main]

use libfuzzer_sys::fuzz_target;
use tau_gitlab_issues::{parse_gitlab_webhook_json, GitlabWebhookPayload};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    match parse_gitlab_webhook_json(&raw) {
        Ok(GitlabWebhookPayload::Note(event)) => {
            assert_eq!(event.comment_id(), event.object_attributes.id.to_string());
            if event.is_issue_note() {
                assert!(event.issue_iid().is_some());
            }
        }
        Ok(GitlabWebhookPayload::Issue(event)) => {
            if let Some(changes) = event.changes.as_ref() {
                if changes.is_empty() {
                    assert!(event.title_change().is_none());
                }
            }
        }
        Ok(GitlabWebhookPayload::Unsupported { object_kind }) => {
            assert!(object_kind != "note" && object_kind != "issue");
        }
        Err(error) => {
            assert!(!error.to_string().trim().is_empty());
        }
    }
});
