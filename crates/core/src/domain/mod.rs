pub mod conversation;
pub mod entity;
pub mod plan;
pub mod tool;
