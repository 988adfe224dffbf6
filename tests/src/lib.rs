//! Cross-module tests for the rvemu workspace.

#[cfg(test)]
mod linux_user;
