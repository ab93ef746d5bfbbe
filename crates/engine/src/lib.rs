// Copyright 2025-2026 CEMAXECUTER LLC

pub mod acquisition;
pub mod config;
pub mod control;
pub mod ring;
