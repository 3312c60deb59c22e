pub mod fast;
pub mod table;

pub use fast::{FastRoute, FastRouteEngine};
pub use table::{Route, RouteError, RouteTarget, Router, RouterTable};
