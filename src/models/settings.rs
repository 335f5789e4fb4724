pub use tubedl_core::models::settings::*;
