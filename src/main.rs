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

use std::env::args;
use std::path::Path;
use std::process::exit;

use teal::config::Settings;
use teal::parser::Parser;
use teal::program::Program;
use teal::vm::Vm;

fn main() {
    let settings = Settings::discover();
    let path = args().nth(1).unwrap_or_else(|| String::from("Main.tls"));

    let mut program = Program::new(settings);
    let mut parser = Parser::new(&mut program);
    parser.parse_file(Path::new(&path));
    let errors = parser.into_errors();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("{}: {}", path, error);
        }
        exit(1);
    }

    let entry = match program.compile() {
        Ok(pc) => pc,
        Err(errors) => {
            for error in &errors {
                eprintln!("{}", error);
            }
            exit(1);
        }
    };

    let mut vm = Vm::new(program);
    let mut stdout = std::io::stdout();
    if let Err(e) = vm.run(entry, &mut stdout) {
        eprintln!("runtime error: {}", e);
        exit(1);
    }

    vm.print_stats(&mut stdout);
}
