pub mod events;
pub mod governor;
pub mod orchestrator;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
