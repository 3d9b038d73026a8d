// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sessions registered without a name get a random Pokémon name, which
//! is a lot easier to type into `mux attach` than a uuid prefix.

use hexe_protocol::Uid;

const NAMES: &[&str] = &[
    "bulbasaur", "ivysaur", "venusaur", "charmander", "charmeleon", "charizard", "squirtle",
    "wartortle", "blastoise", "caterpie", "metapod", "butterfree", "weedle", "kakuna", "beedrill",
    "pidgey", "pidgeotto", "pidgeot", "rattata", "raticate", "spearow", "fearow", "ekans", "arbok",
    "pikachu", "raichu", "sandshrew", "sandslash", "nidoran", "nidorina", "nidoqueen", "nidorino",
    "nidoking", "clefairy", "clefable", "vulpix", "ninetales", "jigglypuff", "wigglytuff", "zubat",
    "golbat", "oddish", "gloom", "vileplume", "paras", "parasect", "venonat", "venomoth",
    "diglett", "dugtrio", "meowth", "persian", "psyduck", "golduck", "mankey", "primeape",
    "growlithe", "arcanine", "poliwag", "poliwhirl", "poliwrath", "abra", "kadabra", "alakazam",
    "machop", "machoke", "machamp", "bellsprout", "weepinbell", "victreebel", "tentacool",
    "tentacruel", "geodude", "graveler", "golem", "ponyta", "rapidash", "slowpoke", "slowbro",
    "magnemite", "magneton", "farfetchd", "doduo", "dodrio", "seel", "dewgong", "grimer", "muk",
    "shellder", "cloyster", "gastly", "haunter", "gengar", "onix", "drowzee", "hypno", "krabby",
    "kingler", "voltorb", "electrode", "exeggcute", "exeggutor", "cubone", "marowak", "hitmonlee",
    "hitmonchan", "lickitung", "koffing", "weezing", "rhyhorn", "rhydon", "chansey", "tangela",
    "kangaskhan", "horsea", "seadra", "goldeen", "seaking", "staryu", "starmie", "scyther",
    "jynx", "electabuzz", "magmar", "pinsir", "tauros", "magikarp", "gyarados", "lapras", "ditto",
    "eevee", "vaporeon", "jolteon", "flareon", "porygon", "omanyte", "omastar", "kabuto",
    "kabutops", "aerodactyl", "snorlax", "articuno", "zapdos", "moltres", "dratini", "dragonair",
    "dragonite", "mewtwo", "mew",
];

/// Pick a name seeded by the session id so retries are stable.
pub fn session_name(seed: Uid) -> String {
    let bytes = seed.as_bytes();
    let mut acc: u64 = 0;
    for b in bytes.iter() {
        acc = acc.wrapping_mul(31).wrapping_add(*b as u64);
    }
    String::from(NAMES[(acc % NAMES.len() as u64) as usize])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_is_stable_per_seed() {
        let id = Uid::generate();
        assert_eq!(session_name(id), session_name(id));
    }

    #[test]
    fn names_vary_across_seeds() {
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..64 {
            distinct.insert(session_name(Uid::generate()));
        }
        // 64 draws from ~150 names should not all collide
        assert!(distinct.len() > 8);
    }
}
