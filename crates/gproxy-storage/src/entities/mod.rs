pub mod credentials;
pub mod downstream_requests;
pub mod global_config;
pub mod internal_events;
pub mod message_requests;
pub mod provider_chain_items;
pub mod providers;
pub mod upstream_requests;
pub mod upstream_usages;
pub mod user_keys;
pub mod users;

pub use credentials::Entity as Credentials;
pub use downstream_requests::Entity as DownstreamRequests;
pub use global_config::Entity as GlobalConfig;
pub use internal_events::Entity as InternalEvents;
pub use message_requests::Entity as MessageRequests;
pub use provider_chain_items::Entity as ProviderChainItems;
pub use providers::Entity as Providers;
pub use upstream_requests::Entity as UpstreamRequests;
pub use upstream_usages::Entity as UpstreamUsages;
pub use user_keys::Entity as UserKeys;
pub use users::Entity as Users;
