use std::env;
use std::fs;
use std::process::ExitCode;

use xlsx_crypto::{decrypt_xlsx, is_encrypted, XlsxCryptoError};

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let (input_path, password, output_path) = match (args.next(), args.next(), args.next()) {
        (Some(input), Some(password), Some(output)) => (input, password, output),
        _ => {
            eprintln!("usage: demo <encrypted.xlsx> <password> <output.xlsx>");
            return ExitCode::FAILURE;
        }
    };

    let input = match fs::read(&input_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("cannot read {input_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !is_encrypted(&input) {
        eprintln!("{input_path} is not an encrypted OOXML container");
        return ExitCode::FAILURE;
    }

    match decrypt_xlsx(&input, &password) {
        Ok(plaintext) => {
            if let Err(e) = fs::write(&output_path, &plaintext) {
                eprintln!("cannot write {output_path}: {e}");
                return ExitCode::FAILURE;
            }
            println!("decrypted {} bytes into {output_path}", plaintext.len());
            ExitCode::SUCCESS
        }
        Err(XlsxCryptoError::BadPassword) => {
            eprintln!("wrong password for {input_path}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("decryption failed: {e}");
            ExitCode::FAILURE
        }
    }
}
