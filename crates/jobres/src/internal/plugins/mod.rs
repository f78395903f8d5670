pub(crate) mod accounting;
pub(crate) mod gres;
pub(crate) mod switch;
pub(crate) mod topology;
