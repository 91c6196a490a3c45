// rillscript: an embeddable, dynamically-typed scripting language.
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

//! A small, embeddable scripting-language runtime: lexer, parser,
//! bytecode compiler and a stack-based VM with a tracing GC. See
//! `SPEC_FULL.md` and `DESIGN.md` for the design and grounding.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod embed;
pub mod error;
pub mod heap;
pub mod lexer;
pub mod parser;
pub mod strings;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use error::{Error, Result};
pub use value::Value;
pub use vm::Vm;
