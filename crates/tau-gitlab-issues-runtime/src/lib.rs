//! Async runtime for the Tau GitLab issue ⇄ Matrix room bridge.
//!
//! [`GitlabIssueConnection`] implements the per-issue bridging protocol on top
//! of the collaborator traits in [`bridge_collaborators`]. The remaining
//! modules provide concrete collaborators (GitLab REST, Matrix
//! application-service delivery), configuration, routing, and HTTP ingress.

pub mod appservice_identity;
pub mod bridge_bootstrap;
pub mod bridge_collaborators;
pub mod bridge_config;
mod bridge_transport_helpers;
pub mod connection_registry;
pub mod gitlab_api_client;
pub mod gitlab_issue_connection;
pub mod matrix_delivery_client;
pub mod webhook_server;

#[cfg(test)]
mod test_support;

pub use appservice_identity::{AppserviceIdentityResolver, CredentialDirectory, CredentialRecord};
pub use bridge_bootstrap::{build_bridge_deps, build_comment_ledger, build_connection_registry};
pub use bridge_collaborators::{
    CreatedComment, DeliveryAck, DeliverySink, IdentityResolver, RoomIdentity, RoomMetadataField,
    TrackerActor, TrackerClient, TrackerCredentials,
};
pub use bridge_config::{load_bridge_config, BridgeConfig};
pub use connection_registry::{ConnectionRegistry, DispatchReport};
pub use gitlab_api_client::GitlabApiClient;
pub use gitlab_issue_connection::{
    GitlabIssueConnection, GitlabIssueConnectionConfig, GitlabIssueConnectionDeps,
    InboundCommentOutcome, IssueEditOutcome, MessageEventOutcome, OutboundCommentOutcome,
    DEFAULT_COMMENT_GRACE_PERIOD,
};
pub use matrix_delivery_client::MatrixDeliveryClient;
pub use webhook_server::{build_bridge_router, serve_bridge, BridgeServerState};
