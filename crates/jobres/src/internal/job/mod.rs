pub(crate) mod jobmap;
pub(crate) mod record;
pub(crate) mod state;
