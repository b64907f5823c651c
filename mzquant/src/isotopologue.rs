use mzquant::IsotopologueLibrary;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(molecule) = args.next().inspect(|s| eprintln!("molecule: {s}")) else {
        eprintln!("Expected a molecule, e.g. PEPTIDE or +C(2)H(6)O(1)");
        return ExitCode::FAILURE;
    };
    let charge = match args.next().map(|s| s.parse::<i32>()) {
        Some(Ok(z)) => z,
        Some(Err(e)) => {
            eprintln!("Expected an integer charge: {e}");
            return ExitCode::FAILURE;
        }
        None => 1,
    };
    eprintln!("z: {charge}");

    let library = match IsotopologueLibrary::builder()
        .molecules([molecule.as_str()])
        .charges([charge])
        .build()
    {
        Ok(library) => library,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match library.overview(&molecule, charge) {
        Some(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("No isotope pattern for {molecule} at charge {charge}");
            ExitCode::FAILURE
        }
    }
}
