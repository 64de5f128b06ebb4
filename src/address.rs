use serde::Serialize;

const SEPARATOR: &str = ", ";

const NO_NUMBER_SENTINELS: &[&str] = &["S/N", "SN", "S/Nº", "S/N°", "S.N.", "SEM NUMERO", "SEM NÚMERO"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressRecord {
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub municipality: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

impl AddressRecord {
    pub fn format(&self) -> String {
        let number = self
            .number
            .as_deref()
            .map(str::trim)
            .filter(|value| !is_no_number(value));
        [
            self.street.as_deref(),
            number,
            self.neighborhood.as_deref(),
            self.municipality.as_deref(),
            self.state.as_deref(),
            self.postal_code.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
    }

    pub fn locality_hint(&self) -> Option<String> {
        let parts: Vec<&str> = [self.municipality.as_deref(), self.state.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(SEPARATOR))
        }
    }
}

pub fn is_no_number(value: &str) -> bool {
    let normalized = value.trim().to_uppercase();
    NO_NUMBER_SENTINELS.iter().any(|sentinel| normalized == *sentinel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: [&str; 6]) -> AddressRecord {
        let wrap = |value: &str| Some(value.to_string());
        AddressRecord {
            street: wrap(fields[0]),
            number: wrap(fields[1]),
            neighborhood: wrap(fields[2]),
            municipality: wrap(fields[3]),
            state: wrap(fields[4]),
            postal_code: wrap(fields[5]),
        }
    }

    #[test]
    fn formats_full_address() {
        let address = record(["Rua A", "12", "Centro", "Iguaba Grande", "RJ", "28970-000"]);
        assert_eq!(
            address.format(),
            "Rua A, 12, Centro, Iguaba Grande, RJ, 28970-000"
        );
        assert_eq!(address.locality_hint().as_deref(), Some("Iguaba Grande, RJ"));
    }

    #[test]
    fn drops_no_number_sentinel_in_any_case() {
        for sentinel in ["S/N", "s/n", "Sn", " sem número "] {
            let address = record(["Rua B", sentinel, "", "Iguaba Grande", "RJ", ""]);
            assert_eq!(address.format(), "Rua B, Iguaba Grande, RJ");
        }
    }

    #[test]
    fn keeps_sentinel_text_outside_number_field() {
        let address = AddressRecord {
            street: Some("SN".into()),
            ..Default::default()
        };
        assert_eq!(address.format(), "SN");
    }

    #[test]
    fn output_is_ordered_subsequence_of_fields() {
        let names = ["st", "12", "nb", "mu", "uf", "cep"];
        for mask in 0u32..64 {
            let mut fields = [""; 6];
            for (position, name) in names.iter().enumerate() {
                if mask & (1 << position) != 0 {
                    fields[position] = name;
                }
            }
            let expected: Vec<&str> = fields.iter().copied().filter(|f| !f.is_empty()).collect();
            assert_eq!(record(fields).format(), expected.join(", "));
        }
    }

    #[test]
    fn empty_record_formats_to_empty_string() {
        assert_eq!(AddressRecord::default().format(), "");
        assert_eq!(record(["", " ", "", "", "", ""]).format(), "");
        assert!(AddressRecord::default().locality_hint().is_none());
    }
}
