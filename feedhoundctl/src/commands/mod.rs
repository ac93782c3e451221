pub mod run;
pub mod selectors;
pub mod session;
