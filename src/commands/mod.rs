mod check;
mod serve;
mod templates;

pub use check::run_check;
pub use serve::run_serve;
pub use templates::run_templates;
