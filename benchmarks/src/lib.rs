// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Criterion benchmarks for subflow. See `benches/`.
