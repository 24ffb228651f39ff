pub mod route;
#[allow(clippy::module_inception)]
pub mod routes;
