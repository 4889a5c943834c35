//! Cross-module scenarios for chorus-core.

#[cfg(test)]
mod unit;
