pub mod encode;
pub mod run;

pub use encode::handle_encode;
pub use run::handle_run;
