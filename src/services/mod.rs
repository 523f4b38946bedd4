pub mod ai;
pub mod collaborators;
pub mod controller;
pub mod dispatcher;
pub mod executors;
pub mod extraction;
pub mod renderer;
pub mod validation;
