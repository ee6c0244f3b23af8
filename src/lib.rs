// Identities, records and the encrypted store
pub mod credentials;

// Credential source precedence
pub mod resolver;

// The active Snowflake session
pub mod session;

// Chat-invocable authentication tools
pub mod tools;

// HTTP API
pub mod api;

// Server configuration
pub mod config;
