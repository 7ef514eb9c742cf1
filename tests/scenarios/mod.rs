//! End-to-end scenarios driven through the public `Runner` API

mod crash_resume;
mod fan_out;
mod success_chain;
mod subprocess_steps;
