// teal: a statically-typed, class-based scripting language.
//
// Copyright (C) 2026  The teal authors
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// The crate is a pipeline: scanner -> parser (+ template instantiation)
// -> class/function registries -> bytecode emitter -> stack VM. Built-in
// modules (IO, Math, FS, Mem, Time, ...) sit behind a single dispatch
// boundary in `modules`.

extern crate byteorder;
extern crate enumflags2;
extern crate num_enum;
extern crate ron;
extern crate serde;
#[macro_use]
extern crate lazy_static;

/// Debug output for tests; compiled away otherwise.
#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => { if cfg!(test) { println! { $($thing),* } } };
);

pub mod ast;
pub mod bytecode;
pub mod class;
pub mod config;
pub mod emit;
pub mod memory;
pub mod modules;
pub mod parser;
pub mod program;
pub mod scanner;
pub mod scope;
pub mod template;
pub mod types;
pub mod value;
pub mod vm;
