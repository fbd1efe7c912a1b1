pub mod ad;
pub mod clock;
pub mod config;
pub mod job;
pub mod matching;
pub mod predicate;
pub mod queue;
pub mod route;
pub mod router;
pub mod sync;
pub mod transform;

pub use router::{Collaborators, JobRouter, RouteChoice, RouterContext};
