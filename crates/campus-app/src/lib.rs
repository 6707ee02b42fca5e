// Application layer: the REST collaborator and the event loop that drives a
// session from push events, user intents and the clock.

pub mod api;
pub mod app;
pub mod protocol;
