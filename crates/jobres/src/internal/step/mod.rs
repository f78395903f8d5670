pub(crate) mod cores;
pub(crate) mod error;
pub(crate) mod layout;
pub(crate) mod manager;
pub(crate) mod pack;
pub(crate) mod picker;
pub(crate) mod record;
pub(crate) mod request;
