pub mod learners;
pub mod models;
