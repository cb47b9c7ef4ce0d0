use rand::Rng;

const SYSTEM_TYPES: [&str; 7] = [
    "Linux",
    "X11",
    "Macintosh",
    "Windows",
    "iPod",
    "iPhone",
    "iPad",
];

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a structurally plausible random Chrome user-agent string.
///
/// Platform token, platform-specific system information, WebKit version and
/// Chrome/Safari version tokens are all drawn from bounded random ranges so
/// the output matches the grammar of real Chrome UAs. Mobile-class platforms
/// get the ` Mobile` marker. Plausibility only, nothing cryptographic.
pub fn random_chrome_user_agent() -> String {
    let mut rng = rand::rng();
    let system_type = SYSTEM_TYPES[rng.random_range(0..SYSTEM_TYPES.len())];

    let system_information = generate_system_information(&mut rng, system_type);
    let platform = format!(
        "AppleWebKit/{}.{}",
        rng.random_range(500..=700),
        rng.random_range(0..=99)
    );
    let extensions = generate_extensions(&mut rng, system_type);

    format!("Mozilla/5.0 ({system_information}) {platform} (KHTML, like Gecko) {extensions}")
}

fn random_char(rng: &mut impl Rng) -> char {
    CHARSET[rng.random_range(0..CHARSET.len())] as char
}

fn generate_system_information(rng: &mut impl Rng, system_type: &str) -> String {
    let mut info = format!("{system_type}; ");

    match system_type {
        "Linux" => {
            info.push_str(&format!(
                "Android {}.{}; ",
                rng.random_range(6..=12),
                rng.random_range(0..=4)
            ));

            for _ in 0..rng.random_range(2..=4) {
                info.push(random_char(rng));
            }
            info.push('-');
            for _ in 0..rng.random_range(2..=6) {
                info.push(random_char(rng));
            }

            if rng.random_bool(0.5) {
                info.push_str(" Build/");
                for _ in 0..rng.random_range(4..=10) {
                    if rng.random_bool(0.5) {
                        info.push(char::from_digit(rng.random_range(0..=9), 10).unwrap_or('0'));
                    } else {
                        info.push(random_char(rng));
                    }
                }
                if rng.random_bool(0.5) {
                    info.push_str("; wv");
                }
            }
        }
        "X11" => {
            if rng.random_bool(0.5) {
                let distro = if rng.random_bool(0.5) { "Ubuntu" } else { "Fedora" };
                info.push_str(&format!("{distro}; "));
            }

            let arch = if rng.random_bool(0.5) { "i686" } else { "x86_64" };
            info.push_str(&format!("Linux {arch}"));

            if rng.random_bool(0.5) {
                info.push_str(&format!("; rv:{}", rng.random_range(50..=90)));
                for _ in 0..rng.random_range(1..=2) {
                    info.push_str(&format!(".{}", rng.random_range(0..=9)));
                }
            }
        }
        "Macintosh" => {
            info.push_str(&format!(
                "Intel Mac OS X {}_{}_{}",
                rng.random_range(5..=20),
                rng.random_range(5..=20),
                rng.random_range(5..=20)
            ));
        }
        "iPod" | "iPhone" | "iPad" => {
            info.push_str(&format!(
                "CPU OS {}_{}",
                rng.random_range(5..=20),
                rng.random_range(5..=20)
            ));
            if rng.random_bool(0.5) {
                info.push_str(&format!("_{}", rng.random_range(5..=20)));
            }
            info.push_str(" like Mac OS X");
        }
        _ => {
            info.push_str("Win64; x64");
        }
    }

    info
}

fn generate_extensions(rng: &mut impl Rng, system_type: &str) -> String {
    let mut extensions = format!(
        "Chrome/{}.0.{}.0",
        rng.random_range(70..=99),
        rng.random_range(1000..=9999)
    );

    if matches!(system_type, "Linux" | "iPod" | "iPhone" | "iPad") {
        extensions.push_str(" Mobile");
    }

    extensions.push_str(&format!(
        " Safari/{}.{}",
        rng.random_range(500..=700),
        rng.random_range(0..=99)
    ));
    extensions
}

/// Chrome major version embedded in a UA string, if present.
///
/// Used by the client-hints evasion to keep brand metadata consistent with
/// the assigned user agent.
pub fn chrome_major_version(user_agent: &str) -> Option<u32> {
    let idx = user_agent.find("Chrome/")?;
    let rest = &user_agent[idx + "Chrome/".len()..];
    let end = rest.find('.').unwrap_or(rest.len());
    rest[..end].parse().ok()
}
