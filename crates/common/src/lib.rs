// supportchat-common: identity, connection state and wire protocol types

pub mod protocol;
pub mod types;
