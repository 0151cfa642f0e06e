pub mod const_fold;
pub mod dce;
pub mod flag_elim;
pub mod identity;
