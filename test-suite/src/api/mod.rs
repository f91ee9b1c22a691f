pub mod service;

#[cfg(test)]
mod basic;
