//! DNS-SD service-name escaping.
//!
//! `dns-sd` style tools print spaces as `\032`. Avahi also escapes `&`,
//! `(` and `)`.

const DNSSD: [(&str, &str); 1] = [(" ", "\\032")];
const AVAHI: [(&str, &str); 4] = [(" ", "\\032"), ("&", "\\038"), ("(", "\\040"), (")", "\\041")];

fn escape(name: &str, table: &[(&str, &str)]) -> String {
    table.iter().fold(name.to_string(), |name, (raw, escaped)| name.replace(raw, escaped))
}

fn unescape(name: &str, table: &[(&str, &str)]) -> String {
    table.iter().fold(name.to_string(), |name, (raw, escaped)| name.replace(escaped, raw))
}

pub fn encode_dnssd(name: &str) -> String {
    escape(name, &DNSSD)
}

pub fn decode_dnssd(name: &str) -> String {
    unescape(name, &DNSSD)
}

pub fn encode_avahi(name: &str) -> String {
    escape(name, &AVAHI)
}

pub fn decode_avahi(name: &str) -> String {
    unescape(name, &AVAHI)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnssd_only_escapes_spaces() {
        assert_eq!(encode_dnssd("Living Room (TV)"), "Living\\032Room\\032(TV)");
        assert_eq!(decode_dnssd("Living\\032Room"), "Living Room");
    }

    #[test]
    fn avahi_escapes_punctuation() {
        let encoded = encode_avahi("Tom & Jerry (2)");
        assert_eq!(encoded, "Tom\\032\\038\\032Jerry\\032\\0402\\041");
        assert_eq!(decode_avahi(&encoded), "Tom & Jerry (2)");
    }
}
