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

use std::env::args;
use std::fs;
use std::process::exit;

use rillscript::{Vm, VmConfig};

fn main() {
    env_logger::init();

    let path = args().nth(1).expect("usage: rill <script>");
    let src = fs::read_to_string(&path).expect("couldn't read script");

    let mut vm = Vm::open(VmConfig::default(), |msg| eprintln!("{msg}"));

    if vm.dostring(&src, &path) == 1 {
        match vm.pop() {
            Ok(v) if v.is_null() => {}
            Ok(v) => println!("{}", describe(&vm, v)),
            Err(_) => {}
        }
    } else {
        exit(1);
    }
}

fn describe(vm: &Vm, v: rillscript::Value) -> String {
    if let Some(n) = vm.get_number(v) {
        n.to_string()
    } else if let Some(b) = v.as_bool() {
        b.to_string()
    } else if let Some(bytes) = vm.get_string(v) {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        format!("<{}>", v.type_name())
    }
}
