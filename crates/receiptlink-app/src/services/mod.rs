// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: the application-side collaborators the printer engine
// consumes, backed by files in the data directory.

pub mod data_dir;
pub mod receipt;
pub mod settings;
