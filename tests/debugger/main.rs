mod common;

mod e2e;
mod exit;
mod handler;
mod lifecycle;
mod nested;
mod property;
mod reconcile;
