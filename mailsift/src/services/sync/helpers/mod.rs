pub mod normalization;
pub mod status_emit;
