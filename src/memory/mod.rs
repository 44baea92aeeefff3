pub mod domain;
pub mod epoch;
pub(crate) mod fatal;
pub mod guard;
pub mod page_arena;
pub(crate) mod pages;
pub mod queue;
pub mod region;
pub mod stats;
pub mod vm;
pub mod window;
